//! Utility functions.
//!
use std::{fs::File, io::Cursor, path::Path};

use anyhow::{Context, Result};
use reqwest::Client;

/// Download the detection model to `filepath` unless it is already present.
pub async fn ensure_model(url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    if filepath.exists() {
        return Ok(());
    }

    log::info!("Downloading model from {url}");
    let resp = Client::new()
        .get(url)
        .send()
        .await
        .context("requesting model")?
        .error_for_status()
        .context("model download rejected")?;

    if let Some(parent) = filepath.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(filepath)?;
    let mut content = Cursor::new(resp.bytes().await.context("reading model body")?);
    std::io::copy(&mut content, &mut file)?;
    log::info!("Model stored at {}", filepath.display());

    Ok(())
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn failed_download_leaves_no_model_file() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\n\r\nnot found")
                .await
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model.onnx");

        let result = ensure_model(&format!("http://{addr}/model.onnx"), &target).await;

        // The 404 body must not be persisted as a model
        assert!(result.is_err());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn existing_model_is_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model.onnx");
        std::fs::write(&target, b"cached").unwrap();

        // The URL is never contacted when the file is present
        ensure_model("http://127.0.0.1:1/unreachable", &target)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"cached");
    }
}
