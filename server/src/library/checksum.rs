use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;

const CHUNK_SIZE: usize = 8192;

/// Streamed SHA-256 of a file, off the async scheduler.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file_sync(&path))
        .await
        .map_err(|e| crate::error::ServiceError::Integrity(format!("hash task failed: {e}")))?
}

fn sha256_file_sync(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = sha256_file(&path).await.unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn large_files_hash_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![0xABu8; CHUNK_SIZE * 3 + 17]).unwrap();

        let streamed = sha256_file(&path).await.unwrap();
        let direct = hex::encode(Sha256::digest(vec![0xABu8; CHUNK_SIZE * 3 + 17]));
        assert_eq!(streamed, direct);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        assert!(sha256_file(Path::new("/nonexistent/file")).await.is_err());
    }
}
