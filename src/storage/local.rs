use super::{EntryKind, FileEntry};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 规范化路径分隔符（统一使用 /）
fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// 读取 Unix 权限位
#[cfg(unix)]
pub fn local_permissions(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn local_permissions(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

/// 读取修改时间（Unix 秒）
pub fn local_modified_time(metadata: &std::fs::Metadata) -> Option<i64> {
    let modified = metadata
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?;
    Some(modified.as_secs() as i64)
}

/// 本地扫描结果
#[derive(Debug, Default)]
pub struct LocalTree {
    pub entries: Vec<FileEntry>,
    /// 无法读取的相对路径（目录无法列出、元数据读取失败、符号链接损坏或成环）
    pub unreadable: Vec<String>,
}

/// 递归扫描本地目录
///
/// `exclude` 接收相对路径，返回 true 时跳过该条目；目录被排除时整个子树都不会进入。
/// 符号链接按其指向的目标处理，与上传时读取的内容一致。
pub async fn scan_local_tree<F>(root: &Path, exclude: F) -> io::Result<LocalTree>
where
    F: Fn(&str) -> bool + Send + 'static,
{
    let metadata = tokio::fs::metadata(root).await?;
    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} 不是一个文件夹", root.display()),
        ));
    }

    let base_path: PathBuf = root.to_path_buf();

    // 使用 spawn_blocking 避免阻塞 async runtime
    let tree = tokio::task::spawn_blocking(move || {
        let relative_of = |path: &Path| -> Option<String> {
            let relative = path.strip_prefix(&base_path).ok()?.to_str()?;
            Some(normalize_separators(relative))
        };

        let mut tree = LocalTree::default();
        let walker = WalkDir::new(&base_path)
            .follow_links(true)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| match relative_of(entry.path()) {
                Some(relative) => !exclude(&relative),
                None => true,
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("读取本地条目失败: {}", e);
                    match e.path().and_then(|p| relative_of(p)) {
                        Some(relative) if !relative.is_empty() => tree.unreadable.push(relative),
                        _ => {}
                    }
                    continue;
                }
            };

            let Some(relative_path) = relative_of(entry.path()) else {
                tracing::warn!("跳过无法识别的路径: {:?}", entry.path());
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("读取本地元数据失败: {}: {}", relative_path, e);
                    tree.unreadable.push(relative_path);
                    continue;
                }
            };
            let kind = if metadata.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };

            tree.entries.push(FileEntry {
                path: relative_path,
                kind,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified_time: local_modified_time(&metadata).unwrap_or(0),
                permissions: local_permissions(&metadata),
            });
        }
        tree
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(tree)
}
