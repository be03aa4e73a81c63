//! 文件枚举
//!
//! 把输入路径展开为确定顺序的文件列表：深度优先，目录内按文件名排序，
//! 跳过隐藏项，不跟随符号链接。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// 名称以 `.` 开头的条目
pub fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// 展开输入路径
///
/// 根路径按给定顺序处理，重复出现的文件只保留第一次。无法访问的条目
/// 记录警告后跳过其子树。
pub fn enumerate<P: AsRef<Path>>(roots: &[P]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for root in roots {
        let root = root.as_ref();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if seen.insert(path.clone()) {
                files.push(path);
            }
        }
    }

    tracing::debug!("Enumerated {} files from {} roots", files.len(), roots.len());
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_enumerate_is_sorted_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("b/2.dcm"));
        touch(&root.join("b/1.dcm"));
        touch(&root.join("a.dcm"));
        touch(&root.join(".hidden/x.dcm"));
        touch(&root.join("b/.DS_Store"));

        let files = enumerate(&[root]);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.dcm"),
                PathBuf::from("b/1.dcm"),
                PathBuf::from("b/2.dcm"),
            ]
        );
    }

    #[test]
    fn test_enumerate_keeps_root_order_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("z.dcm");
        let other = dir.path().join("sub/a.dcm");
        touch(&file);
        touch(&other);

        let files = enumerate(&[file.clone(), dir.path().join("sub"), file.clone()]);
        assert_eq!(files, vec![file, other]);
    }

    #[test]
    fn test_missing_root_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let files = enumerate(&[dir.path().join("absent")]);
        assert!(files.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        touch(&root.join("real.dcm"));
        std::os::unix::fs::symlink(&root, root.join("loop")).unwrap();

        let files = enumerate(&[&root]);
        assert_eq!(files, vec![root.join("real.dcm")]);
    }
}
