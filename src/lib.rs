//! # smali-warn
//!
//! Static behaviour analysis of Android applications from their smali disassembly.
//!
//! An [`Index`] is built once from the `.smali` files of a package. It answers class,
//! method and string constant queries; [`locate_calls`] finds the invoke sites of a method
//! and [`resolve`] traces the argument registers of a call site back to the literals they
//! were loaded from.
//!
//! ```no_run
//!  use smali_warn::{locate_calls, resolve, Index};
//!  use std::path::Path;
//!
//!  let index = Index::from_dir(Path::new("app/smali")).unwrap();
//!  for call in locate_calls("android.telephony.SmsManager", "sendTextMessage", &index).unwrap() {
//!      let args = resolve(&call, &index).unwrap();
//!      println!("{} sends '{}' to {}", call.caller, args[2].value, args[0].value);
//!  }
//! ```

#[macro_use]
mod error;

pub mod behaviours;
pub mod config;
pub mod index;
pub mod instructions;
pub mod locator;
pub mod pattern;
pub mod resolver;
mod smali_parse;
mod tests;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use index::{Class, ClassOrigin, Index, Method, SmaliUnit, StringReference};
pub use locator::{locate_calls, CallSite};
pub use resolver::{resolve, resolve_all, resolve_with, RegisterBinding, ResolveOptions, ResolvedValue, ValueKind};

use log::warn;
use std::path::{Path, PathBuf};

/// Reads every `.smali` file of a package. Files are returned in path order.
///
/// When `dir` is an apktool output folder, only its `smali` and `smali_*` sub-folders are
/// walked, so `.smali` files shipped under `assets/` or `unknown/` are not read. Any other
/// directory is taken to be a smali root and walked recursively.
///
/// # Examples
///
/// ```no_run
///  use smali_warn::load_smali_dir;
///  use std::path::Path;
///
///  let units = load_smali_dir(Path::new("app")).unwrap();
///  println!("{:} smali files loaded.", units.len());
/// ```
pub fn load_smali_dir(dir: &Path) -> Result<Vec<SmaliUnit>> {
    let roots = smali_roots(dir)?;
    let mut paths = vec![];
    if roots.is_empty() {
        collect_smali_paths(dir, &mut paths)?;
    } else {
        for root in &roots {
            collect_smali_paths(root, &mut paths)?;
        }
    }
    paths.sort();
    paths.iter().map(|p| SmaliUnit::read_from_file(p)).collect()
}

/// The `smali`, `smali_classes2` ... folders directly under an apktool output folder.
fn smali_roots(dir: &Path) -> Result<Vec<PathBuf>> {
    let io_err = |source| Error::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut roots = vec![];
    for entry in dir.read_dir().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if (name == "smali" || name.starts_with("smali_")) && entry.file_type().map_err(io_err)?.is_dir() {
            roots.push(entry.path());
        }
    }
    Ok(roots)
}

fn collect_smali_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let io_err = |source| Error::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in dir.read_dir().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_err)?;

        // Directory: recurse sub-directory
        if file_type.is_dir() {
            collect_smali_paths(&path, out)?;
        } else if path.extension().is_some_and(|e| e == "smali") {
            out.push(path);
        } else if file_type.is_file() {
            continue;
        } else {
            warn!("skipping {}: not a regular file", path.display());
        }
    }
    Ok(())
}
