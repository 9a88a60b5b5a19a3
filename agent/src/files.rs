//! Configuration file collection

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use nix::unistd::{Gid, Group, Uid, User};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttr {
    pub mode: String,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub file_attr: FileAttr,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectedFiles {
    pub success_files: Vec<String>,
    pub fail_files: Vec<String>,
    pub infos: Vec<FileInfo>,
}

/// Read every path; each lands in exactly one of the success or fail lists.
pub fn collect_files(paths: &[String]) -> CollectedFiles {
    let mut result = CollectedFiles::default();
    for path in paths {
        match file_info(Path::new(path)) {
            Some(info) => {
                result.success_files.push(path.clone());
                result.infos.push(info);
            }
            None => result.fail_files.push(path.clone()),
        }
    }
    result
}

fn file_info(path: &Path) -> Option<FileInfo> {
    let meta = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => {
            warn!("{} is not a regular file", path.display());
            return None;
        }
        Err(e) => {
            warn!("Cannot stat {}: {e}", path.display());
            return None;
        }
    };
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read {}: {e}", path.display());
            return None;
        }
    };

    Some(FileInfo {
        path: path.display().to_string(),
        file_attr: FileAttr {
            mode: format!("{:04o}", meta.permissions().mode() & 0o7777),
            owner: owner_name(meta.uid()),
            group: group_name(meta.gid()),
        },
        content,
    })
}

fn owner_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}
