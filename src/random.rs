//! 安全随机数生成模块
//!
//! 提供密码学安全的随机数生成功能，用于生成密钥、会话令牌和备用码等敏感数据。

use rand::{TryRngCore, rngs::OsRng};

use crate::error::{CryptoError, Error, Result};

/// 生成指定长度的随机字节数组
///
/// 使用操作系统提供的密码学安全随机数生成器 (CSPRNG)
///
/// # Example
///
/// ```rust
/// use twofa::random::generate_random_bytes;
///
/// let bytes = generate_random_bytes(32).unwrap();
/// assert_eq!(bytes.len(), 32);
/// ```
pub fn generate_random_bytes(length: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Crypto(CryptoError::RngFailed(format!("{:?}", e))))?;
    Ok(bytes)
}

/// 生成指定长度的十六进制随机字符串
///
/// # Arguments
///
/// * `byte_length` - 要生成的字节数（最终字符串长度为字节数的两倍）
///
/// # Example
///
/// ```rust
/// use twofa::random::generate_random_hex;
///
/// let hex = generate_random_hex(16).unwrap();
/// assert_eq!(hex.len(), 32); // 16 bytes = 32 hex chars
/// ```
pub fn generate_random_hex(byte_length: usize) -> Result<String> {
    let bytes = generate_random_bytes(byte_length)?;
    Ok(hex_encode(&bytes))
}

/// 生成指定长度的 Base64 URL 安全随机字符串
///
/// 使用 URL 安全的 Base64 编码（不含填充）
pub fn generate_random_base64_url(byte_length: usize) -> Result<String> {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    let bytes = generate_random_bytes(byte_length)?;
    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}

/// 生成登录挑战会话令牌
///
/// 使用 32 字节（256 位）的随机数据，提供足够的熵
///
/// # Example
///
/// ```rust
/// use twofa::random::generate_challenge_token;
///
/// let token = generate_challenge_token().unwrap();
/// // 适合用作不可猜测的会话 ID
/// ```
pub fn generate_challenge_token() -> Result<String> {
    generate_random_base64_url(32)
}

/// 生成一次性备用码
///
/// 每个码由 4 个随机字节组成，以大写十六进制呈现为 `XXXX-XXXX`，
/// 便于人工抄写。码长固定且公开。
///
/// # Example
///
/// ```rust
/// use twofa::random::generate_backup_codes;
///
/// let codes = generate_backup_codes(10).unwrap();
/// assert_eq!(codes.len(), 10);
/// for code in &codes {
///     assert_eq!(code.len(), 9);
///     assert_eq!(&code[4..5], "-");
/// }
/// ```
pub fn generate_backup_codes(count: usize) -> Result<Vec<String>> {
    let mut codes = Vec::with_capacity(count);

    for _ in 0..count {
        let bytes = generate_random_bytes(4)?;
        let hex = hex_encode(&bytes).to_uppercase();
        codes.push(format!("{}-{}", &hex[..4], &hex[4..]));
    }

    Ok(codes)
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 将字节数组编码为十六进制字符串
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 常量时间比较两个字节切片
///
/// 用于防止时序攻击
///
/// # Example
///
/// ```rust
/// use twofa::random::constant_time_compare;
///
/// let a = b"secret_token";
/// let b = b"secret_token";
/// assert!(constant_time_compare(a, b));
///
/// let c = b"other_token!";
/// assert!(!constant_time_compare(a, c));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// 常量时间比较两个字符串
pub fn constant_time_compare_str(a: &str, b: &str) -> bool {
    constant_time_compare(a.as_bytes(), b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_random_bytes() {
        let bytes = generate_random_bytes(32).unwrap();
        assert_eq!(bytes.len(), 32);

        // 确保生成的是随机的（两次生成不应相同）
        let bytes2 = generate_random_bytes(32).unwrap();
        assert_ne!(bytes, bytes2);
    }

    #[test]
    fn test_generate_random_hex() {
        let hex = generate_random_hex(16).unwrap();
        assert_eq!(hex.len(), 32);

        // 确保只包含十六进制字符
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_random_base64_url() {
        let token = generate_random_base64_url(32).unwrap();

        // URL 安全的 base64 不应包含 + 或 /
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains('='));
    }

    #[test]
    fn test_generate_challenge_token() {
        let token = generate_challenge_token().unwrap();
        assert!(!token.is_empty());

        let token2 = generate_challenge_token().unwrap();
        assert_ne!(token, token2);
    }

    #[test]
    fn test_generate_backup_codes() {
        let codes = generate_backup_codes(10).unwrap();
        assert_eq!(codes.len(), 10);

        // 检查格式：XXXX-XXXX，大写十六进制
        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert!(
                code.chars()
                    .filter(|c| *c != '-')
                    .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
            );
        }

        // 确保所有码都是唯一的
        let unique: HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"hello", b"hello"));
        assert!(!constant_time_compare(b"hello", b"world"));
        assert!(!constant_time_compare(b"hello", b"hell"));
    }

    #[test]
    fn test_constant_time_compare_str() {
        assert!(constant_time_compare_str("secret", "secret"));
        assert!(!constant_time_compare_str("secret", "Secret"));
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }
}
