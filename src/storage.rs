use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// 以 bucket + key 寻址的文档存储
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 读取对象内容，对象不存在时返回 `None`
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;
}

/// 下载并解析 JSON 文档
pub async fn download_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    bucket: &str,
    key: &str,
) -> Result<Option<T>> {
    let Some(body) = store.get_object(bucket, key).await? else {
        return Ok(None);
    };
    let document = serde_json::from_slice(&body)
        .with_context(|| format!("解析 JSON 文档失败: bucket={}, key={}", bucket, key))?;
    Ok(Some(document))
}

/// 序列化并上传 JSON 文档
pub async fn upload_json<T: Serialize + ?Sized>(
    store: &dyn DocumentStore,
    bucket: &str,
    key: &str,
    document: &T,
) -> Result<()> {
    let body = serde_json::to_vec_pretty(document)
        .with_context(|| format!("序列化 JSON 文档失败: key={}", key))?;
    store.put_object(bucket, key, body).await
}

/// 本地文件系统存储：bucket 对应根目录下的子目录
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key.trim_start_matches('/'))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(bucket, key);
        match tokio::fs::read(&path).await {
            Ok(body) => {
                tracing::debug!("已读取文档: {}", path.display());
                Ok(Some(body))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("读取文档失败: {}", path.display())),
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.object_path(bucket, key);

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("创建输出目录失败")?;
        }

        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("写入文档失败: {}", path.display()))?;
        tracing::info!("文档已写入: {}", path.display());
        Ok(())
    }
}
