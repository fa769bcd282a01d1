use crate::SearchError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

pub(crate) async fn load_json<T>(path: &Path) -> Result<T, SearchError>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(error) => Err(SearchError::dependency(
            "snapshot",
            format!("{}: {error}", path.display()),
        )),
    }
}

// Replaces `path` wholesale: the new content lands in a sibling temp file
// which is then renamed over the target, so readers never see a partial file.
pub(crate) async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), SearchError>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec_pretty(value)?;
    let io_error =
        |error: std::io::Error| SearchError::dependency("snapshot", format!("{}: {error}", path.display()));

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let staging = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    tokio::fs::write(&staging, &bytes).await.map_err(io_error)?;
    if let Err(error) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(io_error(error));
    }

    debug!(path = %path.display(), bytes = bytes.len(), "snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn missing_snapshot_loads_as_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded: BTreeMap<String, u32> = load_json(&dir.path().join("absent.json"))
            .await
            .expect("load");
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn snapshot_round_trips_and_leaves_no_staging_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        let value = BTreeMap::from([("a".to_string(), 1u32)]);

        write_json_atomic(&path, &value).await.expect("write");
        let loaded: BTreeMap<String, u32> = load_json(&path).await.expect("load");
        assert_eq!(loaded, value);

        let entries = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(entries, 1);
    }
}
