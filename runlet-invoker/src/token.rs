use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fs;

/// Issuer claim carried by every token minted here.
pub const ISSUER: &str = "runlet.io/invoker";
/// Audience claim; the runlet API validates both.
pub const AUDIENCE: &str = "runlet.io/api";

/// Invoker tokens are regenerated on every pass, so they only need to
/// outlive a single request round-trip.
const INVOKER_TOKEN_EXPIRES_IN: u64 = 30;

/// Signing key with its matching algorithm: symmetric material signs
/// with HS256, an RSA private key signs with RS256.
#[derive(Clone)]
pub struct TokenKey {
    key: EncodingKey,
    algorithm: Algorithm,
}

/// A signed bearer token.
pub struct Token {
    pub raw: String,
    /// Seconds until expiration; zero means the token never expires.
    pub expires_in: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct Claims {
    iss: String,
    aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

///
///
///
pub fn import_key(secret: Option<&str>, private_key: Option<&str>) -> Result<TokenKey> {
    if let Some(path) = private_key {
        let pem = fs::read(path).with_context(|| format!("Failed to read JWT private key: {}", path))?;
        let key = EncodingKey::from_rsa_pem(&pem).context("JWT private key is not a valid RSA PEM.")?;

        Ok(TokenKey {
            key,
            algorithm: Algorithm::RS256,
        })
    } else if let Some(secret) = secret {
        Ok(TokenKey {
            key: EncodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
        })
    } else {
        bail!("Specify a JWT secret or a JWT private key.");
    }
}

/// Token used to authenticate the invoker's own requests.
pub fn sign_invoker_token(key: &TokenKey) -> Result<Token> {
    let iat = Utc::now().timestamp() as u64;

    let claims = Claims {
        iss: String::from(ISSUER),
        aud: String::from(AUDIENCE),
        sub: None,
        iat,
        exp: Some(iat + INVOKER_TOKEN_EXPIRES_IN),
    };

    let raw = encode(&Header::new(key.algorithm), &claims, &key.key).context("Failed to sign invoker token.")?;

    Ok(Token {
        raw,
        expires_in: INVOKER_TOKEN_EXPIRES_IN,
    })
}

/// Token used to authenticate a pod's requests. Carries no expiration:
/// the pod's own lifetime bounds its validity, and its run duration is
/// unknown in advance.
pub fn sign_pod_token(key: &TokenKey, pod_name: &str) -> Result<Token> {
    let claims = Claims {
        iss: String::from(ISSUER),
        aud: String::from(AUDIENCE),
        sub: Some(String::from(pod_name)),
        iat: Utc::now().timestamp() as u64,
        exp: None,
    };

    let raw = encode(&Header::new(key.algorithm), &claims, &key.key).context("Failed to sign pod token.")?;

    Ok(Token {
        raw,
        expires_in: 0,
    })
}
