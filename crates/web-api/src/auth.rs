//! JWT 认证
//!
//! 签发与校验访问令牌，并作为会话准入时的认证预言机。

use application::{ApplicationError, Authenticator, Credentials};
use async_trait::async_trait;
use axum::http::HeaderMap;
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let exp = OffsetDateTime::now_utc() + Duration::hours(self.config.expiration_hours);
        let claims = Claims {
            user_id: user_id.into(),
            exp: exp.unix_timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| {
                ApiError::internal_server_error(format!("token generation failed: {err}"))
            })
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| {
                tracing::debug!(error = %err, "令牌校验失败");
                ApiError::unauthorized("invalid token")
            })
    }

    /// 从 headers 中提取和验证 token
    pub fn extract_user_from_headers(&self, headers: &HeaderMap) -> Result<UserId, ApiError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ApiError::unauthorized("missing or malformed authorization header"))?;
        let claims = self.verify_token(token)?;
        Ok(UserId::from(claims.user_id))
    }
}

/// 取出 `Authorization: Bearer <token>` 中的令牌。
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

#[async_trait]
impl Authenticator for JwtService {
    async fn current_identity(
        &self,
        credentials: &Credentials,
    ) -> Result<UserId, ApplicationError> {
        let token = credentials
            .token
            .as_deref()
            .ok_or(ApplicationError::Unauthorized)?;
        self.verify_token(token)
            .map(|claims| UserId::from(claims.user_id))
            .map_err(|_| ApplicationError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn service(secret: &str) -> JwtService {
        JwtService::new(JwtConfig {
            secret: secret.to_string(),
            expiration_hours: 1,
        })
    }

    #[tokio::test]
    async fn issued_tokens_resolve_to_the_same_user() {
        let jwt = service("a-very-long-test-secret-value");
        let user = UserId::generate();
        let token = jwt.generate_token(user).unwrap();

        let identity = jwt
            .current_identity(&Credentials::bearer(token.clone()))
            .await
            .unwrap();
        assert_eq!(identity, user);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert_eq!(jwt.extract_user_from_headers(&headers).unwrap(), user);
    }

    #[tokio::test]
    async fn foreign_or_missing_tokens_are_unauthorized() {
        let issuer = service("first-secret-value-for-tests");
        let verifier = service("second-secret-value-for-tests");
        let token = issuer.generate_token(UserId::generate()).unwrap();

        let err = verifier
            .current_identity(&Credentials::bearer(token))
            .await
            .unwrap_err();
        assert_eq!(err, ApplicationError::Unauthorized);

        let err = verifier
            .current_identity(&Credentials::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err, ApplicationError::Unauthorized);

        assert!(verifier.extract_user_from_headers(&HeaderMap::new()).is_err());
    }
}
