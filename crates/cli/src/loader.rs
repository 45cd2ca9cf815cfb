//! Policy document loading from files and directories.

use std::path::{Path, PathBuf};

use sieve_eval::config::CONFIG_FILE_NAME;
use sieve_interchange::{bundle_from_interchange, PolicyDocument};

/// One source file and what it held.
pub(crate) struct LoadedFile {
    pub path: PathBuf,
    pub documents: Result<Vec<PolicyDocument>, String>,
}

/// Load `path`: a single bundle file, or every `*.json` file in a directory
/// except the PDP configuration, in file name order.
pub(crate) fn load(path: &Path) -> Result<Vec<LoadedFile>, String> {
    let files = if path.is_dir() {
        let entries = std::fs::read_dir(path)
            .map_err(|e| format!("error reading directory '{}': {}", path.display(), e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(CONFIG_FILE_NAME))
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    Ok(files
        .into_iter()
        .map(|path| {
            let documents = load_file(&path);
            LoadedFile { path, documents }
        })
        .collect())
}

fn load_file(path: &Path) -> Result<Vec<PolicyDocument>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("error reading file '{}': {}", path.display(), e))?;
    let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| format!("error parsing JSON in '{}': {}", path.display(), e))?;
    bundle_from_interchange(&json).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Load `path` and require every file to be valid.
pub(crate) fn load_all(path: &Path) -> Result<Vec<PolicyDocument>, String> {
    let mut documents = Vec::new();
    for file in load(path)? {
        documents.extend(file.documents?);
    }
    Ok(documents)
}
