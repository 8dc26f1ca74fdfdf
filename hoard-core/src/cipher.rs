//! Stream cipher: AES-256-CTR over async byte streams with the IV written
//! in the clear ahead of the ciphertext.
//!
//! Both directions copy in bounded chunks, so arbitrarily large sources are
//! never buffered whole.

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// IV length: one AES block.
pub const IV_SIZE: usize = 16;

const COPY_BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid cipher key length {0}")]
    Init(usize),
    #[error("stream shorter than the 16-byte IV")]
    Truncated,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encrypt `src` into `dst`, prefixed by a fresh random IV.
/// Returns bytes written, IV included.
pub async fn encrypt_copy<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let mut cipher = Aes256Ctr::new_from_slices(key, &iv).map_err(|_| CipherError::Init(key.len()))?;
    dst.write_all(&iv).await?;
    let n = apply_copy(&mut cipher, src, dst).await?;
    Ok(IV_SIZE as u64 + n)
}

/// Read the IV off the head of `src`, then decrypt the rest into `dst`.
/// Returns plaintext bytes written.
pub async fn decrypt_copy<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    match src.read_exact(&mut iv).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CipherError::Truncated)
        }
        Err(e) => return Err(e.into()),
    }
    let mut cipher = Aes256Ctr::new_from_slices(key, &iv).map_err(|_| CipherError::Init(key.len()))?;
    Ok(apply_copy(&mut cipher, src, dst).await?)
}

async fn apply_copy<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EncryptionKey;

    async fn roundtrip(data: &[u8]) {
        let key = EncryptionKey::generate();
        let mut sealed = Vec::new();
        let n = encrypt_copy(key.as_bytes(), &mut &data[..], &mut sealed)
            .await
            .unwrap();
        assert_eq!(n as usize, IV_SIZE + data.len());
        assert_eq!(sealed.len(), IV_SIZE + data.len());

        let mut opened = Vec::new();
        let n = decrypt_copy(key.as_bytes(), &mut &sealed[..], &mut opened)
            .await
            .unwrap();
        assert_eq!(n as usize, data.len());
        assert_eq!(opened, data);
    }

    #[tokio::test]
    async fn roundtrip_edge_lengths() {
        for len in [0, 1, IV_SIZE - 1, IV_SIZE, IV_SIZE + 1] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            roundtrip(&data).await;
        }
    }

    #[tokio::test]
    async fn roundtrip_several_megabytes() {
        let data: Vec<u8> = (0..3 * 1024 * 1024 + 7).map(|i| (i % 251) as u8).collect();
        roundtrip(&data).await;
    }

    #[tokio::test]
    async fn ciphertext_differs_from_plaintext() {
        let key = EncryptionKey::generate();
        let data = b"is the test working";
        let mut sealed = Vec::new();
        encrypt_copy(key.as_bytes(), &mut &data[..], &mut sealed)
            .await
            .unwrap();
        assert_ne!(&sealed[IV_SIZE..], &data[..]);
    }

    #[tokio::test]
    async fn fresh_iv_per_call() {
        let key = EncryptionKey::generate();
        let mut a = Vec::new();
        let mut b = Vec::new();
        encrypt_copy(key.as_bytes(), &mut &b"same"[..], &mut a).await.unwrap();
        encrypt_copy(key.as_bytes(), &mut &b"same"[..], &mut b).await.unwrap();
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE]);
    }

    #[tokio::test]
    async fn wrong_key_length_fails() {
        let mut out = Vec::new();
        let err = encrypt_copy(&[0u8; 7], &mut &b"x"[..], &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Init(7)));
        let sealed = [0u8; IV_SIZE + 4];
        let err = decrypt_copy(&[0u8; 12], &mut &sealed[..], &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Init(12)));
    }

    #[tokio::test]
    async fn short_source_is_truncated() {
        let key = EncryptionKey::generate();
        let mut out = Vec::new();
        let err = decrypt_copy(key.as_bytes(), &mut &[1u8, 2, 3][..], &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Truncated));
    }
}
