//! 文件内容摘要

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// 读取缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 摘要算法，需要与服务端生成清单时使用的算法一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Blake3,
    Sha256,
    /// 兼容按 MD5 生成清单的文件服务器
    Md5,
}

/// 内容摘要计算器
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher {
    algorithm: DigestAlgorithm,
}

impl ContentHasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// 计算字节内容的摘要（小写十六进制）
    pub fn digest(&self, data: &[u8]) -> String {
        match self.algorithm {
            DigestAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            DigestAlgorithm::Md5 => hex::encode(Md5::digest(data)),
        }
    }

    /// 流式计算文件摘要，读取错误交给调用方处理
    pub fn digest_file(&self, path: &Path) -> std::io::Result<String> {
        let mut file = std::fs::File::open(path)?;

        match self.algorithm {
            DigestAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                read_blocks(&mut file, |block| {
                    hasher.update(block);
                })?;
                Ok(hasher.finalize().to_hex().to_string())
            }
            DigestAlgorithm::Sha256 => digest_reader::<Sha256>(&mut file),
            DigestAlgorithm::Md5 => digest_reader::<Md5>(&mut file),
        }
    }
}

fn digest_reader<D: Digest>(reader: &mut impl Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    read_blocks(reader, |block| hasher.update(block))?;
    Ok(hex::encode(hasher.finalize()))
}

fn read_blocks(reader: &mut impl Read, mut f: impl FnMut(&[u8])) -> std::io::Result<()> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            return Ok(());
        }
        f(&buffer[..n]);
    }
}
