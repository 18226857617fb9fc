//! 静态密钥加密模块
//!
//! 提供对静态存储的小型机密（TOTP 密钥、备用码）的对称加解密。
//!
//! ## 线格式
//!
//! 密文编码为 `hex(iv) + ":" + hex(ciphertext)`，使用 AES-256-CBC，
//! 每次加密生成随机的 16 字节 IV。
//!
//! ## 遗留格式兼容
//!
//! 在引入加密之前写入的数据可能是明文或其他遗留编码。`decrypt` 对此保持
//! 宽容：无法按当前格式解码的输入会原样返回，并通过
//! [`DecodeResult::was_legacy_format`] 标记走过了回退路径。这是刻意的
//! 可用性优先取舍，调用方与测试可以据此断言具体走了哪条路径。
//!
//! ## 示例
//!
//! ```rust
//! use twofa::cipher::SecretCipher;
//!
//! let cipher = SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap();
//!
//! let ciphertext = cipher.encrypt("JBSWY3DPEHPK3PXP").unwrap();
//! assert!(ciphertext.contains(':'));
//!
//! let decoded = cipher.decrypt(&ciphertext);
//! assert_eq!(decoded.value, "JBSWY3DPEHPK3PXP");
//! assert!(!decoded.was_legacy_format);
//! ```

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::error::{ConfigError, CryptoError, Error, Result};
use crate::random::generate_random_bytes;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// CBC 模式的 IV 长度（字节）
const IV_LENGTH: usize = 16;

/// 密钥长度（字节）
const KEY_LENGTH: usize = 32;

/// 解密结果
///
/// `was_legacy_format` 为 true 表示输入未按当前 `hex(iv):hex(ct)` 格式
/// 解码，值被原样返回。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeResult {
    /// 解密后的明文（回退路径下为原始输入）
    pub value: String,
    /// 是否走了遗留格式回退路径
    pub was_legacy_format: bool,
}

impl DecodeResult {
    fn decrypted(value: String) -> Self {
        Self {
            value,
            was_legacy_format: false,
        }
    }

    fn legacy(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            was_legacy_format: true,
        }
    }
}

/// 静态机密加密器
///
/// 从配置的密钥材料派生 32 字节 AES-256 密钥。短于 32 字节的密钥材料会被
/// 零填充——这是仅供非生产环境使用的弱回退，会在构造时记录警告。
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 不输出密钥内容
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// 从密钥材料创建加密器
    ///
    /// 密钥材料不能为空；长于 32 字节的部分被截断，短于 32 字节时零填充。
    pub fn new(key_material: &[u8]) -> Result<Self> {
        if key_material.is_empty() {
            return Err(Error::Config(ConfigError::MissingRequired(
                "cipher key material".to_string(),
            )));
        }

        if key_material.len() < KEY_LENGTH {
            tracing::warn!(
                provided_len = key_material.len(),
                "cipher key material shorter than 32 bytes, zero-padding (not for production)"
            );
        }

        let mut key = [0u8; KEY_LENGTH];
        let len = key_material.len().min(KEY_LENGTH);
        key[..len].copy_from_slice(&key_material[..len]);

        Ok(Self { key })
    }

    /// 加密明文
    ///
    /// 返回 `hex(iv):hex(ciphertext)` 格式的字符串。
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let iv = generate_random_bytes(IV_LENGTH)?;

        let encryptor = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!("{}:{}", hex::encode(&iv), hex::encode(&ciphertext)))
    }

    /// 解密存储值
    ///
    /// 无法按当前格式解码的输入原样返回并标记为遗留格式，不会报错。
    pub fn decrypt(&self, stored: &str) -> DecodeResult {
        // 没有分隔符的值视为遗留明文/编码，原样返回
        let Some((iv_hex, ct_hex)) = stored.split_once(':') else {
            return DecodeResult::legacy(stored);
        };

        let Ok(iv) = hex::decode(iv_hex) else {
            tracing::warn!("secret value has malformed IV hex, returning as legacy");
            return DecodeResult::legacy(stored);
        };
        if iv.len() != IV_LENGTH {
            tracing::warn!(iv_len = iv.len(), "secret value has wrong IV length, returning as legacy");
            return DecodeResult::legacy(stored);
        }

        let Ok(ciphertext) = hex::decode(ct_hex) else {
            tracing::warn!("secret value has malformed ciphertext hex, returning as legacy");
            return DecodeResult::legacy(stored);
        };

        let Ok(decryptor) = Aes256CbcDec::new_from_slices(&self.key, &iv) else {
            tracing::warn!("cipher state rejected IV, returning value as legacy");
            return DecodeResult::legacy(stored);
        };

        match decryptor.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(value) => DecodeResult::decrypted(value),
                Err(_) => {
                    tracing::warn!("decrypted secret is not valid UTF-8, returning as legacy");
                    DecodeResult::legacy(stored)
                }
            },
            Err(_) => {
                tracing::warn!("secret value failed to decrypt, returning as legacy");
                DecodeResult::legacy(stored)
            }
        }
    }
}
