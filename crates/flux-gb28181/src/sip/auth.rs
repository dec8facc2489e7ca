// REGISTER Digest 鉴权（RFC 2617，MD5，不校验 qop/nc）
// nonce 不做重放窗口跟踪

use super::random_token;
use std::collections::HashMap;

/// 401 挑战
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

impl DigestChallenge {
    /// 生成绑定 realm 的新 nonce
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            nonce: random_token(32),
        }
    }

    /// WWW-Authenticate 头部值
    pub fn header_value(&self) -> String {
        format!(
            "Digest nonce=\"{}\", algorithm=MD5, realm=\"{}\", qop=\"auth\"",
            self.nonce, self.realm
        )
    }
}

/// Authorization 头部中的凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl DigestCredentials {
    /// 解析 Authorization 头部，缺少必需字段时返回 None
    pub fn parse(value: &str) -> Option<Self> {
        let params = parse_digest_params(value);
        Some(Self {
            username: params.get("username")?.clone(),
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce: params.get("nonce")?.clone(),
            uri: params.get("uri")?.clone(),
            response: params.get("response")?.clone(),
        })
    }
}

/// 解析 Digest 头部为键值对
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let rest = value
        .trim()
        .strip_prefix("Digest ")
        .unwrap_or(value)
        .trim();

    rest.split(',')
        .filter_map(|part| {
            let (key, val) = part.trim().split_once('=')?;
            let val = val.trim();
            let val = val
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(val);
            Some((key.trim().to_ascii_lowercase(), val.to_string()))
        })
        .collect()
}

/// 计算 Digest 响应：MD5(MD5(user:realm:pass):nonce:MD5(method:uri))
pub fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

/// 校验凭据
pub fn verify(credentials: &DigestCredentials, password: &str, method: &str, uri: &str) -> bool {
    let expected = compute_response(
        &credentials.username,
        &credentials.realm,
        password,
        method,
        uri,
        &credentials.nonce,
    );
    expected.eq_ignore_ascii_case(&credentials.response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(password: &str) -> DigestCredentials {
        let response = compute_response(
            "34020000001320000001",
            "3402000000",
            password,
            "REGISTER",
            "sip:34020000002000000001@3402000000",
            "abcdef",
        );
        DigestCredentials {
            username: "34020000001320000001".to_string(),
            realm: "3402000000".to_string(),
            nonce: "abcdef".to_string(),
            uri: "sip:34020000002000000001@3402000000".to_string(),
            response,
        }
    }

    #[test]
    fn test_known_vector() {
        // RFC 2617 示例参数，不带 qop 时的结果
        let response = compute_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
        );
        assert_eq!(response, "670fd8c2df070c60b045671b8b24ff02");
    }

    #[test]
    fn test_verify_detects_single_char_mutation() {
        let creds = credentials("12345678");
        let uri = creds.uri.clone();
        assert!(verify(&creds, "12345678", "REGISTER", &uri));
        assert!(!verify(&creds, "12345679", "REGISTER", &uri));
        assert!(!verify(&creds, "12345678", "REGISTEr", &uri));
        assert!(!verify(&creds, "12345678", "REGISTER", "sip:34020000002000000001@3402000001"));

        let mut tampered = creds.clone();
        tampered.nonce.push('x');
        assert!(!verify(&tampered, "12345678", "REGISTER", &uri));

        let mut tampered = creds;
        tampered.username.replace_range(0..1, "4");
        assert!(!verify(&tampered, "12345678", "REGISTER", &uri));
    }

    #[test]
    fn test_parse_authorization_header() {
        let header = r#"Digest username="34020000001320000001", realm="3402000000", nonce="44010b73623249f6916a6acf7c316b8e", uri="sip:34020000002000000001@3402000000", response="9625d92fbb9ab1f3ffde1c5e9ba7f7cb", algorithm=MD5"#;
        let creds = DigestCredentials::parse(header).unwrap();
        assert_eq!(creds.username, "34020000001320000001");
        assert_eq!(creds.nonce, "44010b73623249f6916a6acf7c316b8e");
        assert_eq!(creds.uri, "sip:34020000002000000001@3402000000");

        assert!(DigestCredentials::parse("Digest realm=\"x\"").is_none());
    }

    #[test]
    fn test_challenge_header_format() {
        let challenge = DigestChallenge::new("3402000000");
        assert_eq!(challenge.nonce.len(), 32);
        assert_eq!(
            challenge.header_value(),
            format!(
                "Digest nonce=\"{}\", algorithm=MD5, realm=\"3402000000\", qop=\"auth\"",
                challenge.nonce
            )
        );
    }
}
