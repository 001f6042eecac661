//! HTTPS client for the work-server remote-secret endpoint.
//!
//! Three operations against `{base_url}api-client/v1/remote-secret`:
//! create (PUT, two round-trips with a challenge-response in between),
//! fetch (POST, used by the monitor) and delete (DELETE, same
//! challenge-response shape as create). JSON bodies carry binary fields
//! base64-encoded.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blake2::digest::Mac;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::REMOTE_SECRET_LENGTH;
use crate::error::RemoteSecretEndpointError;
use crate::http_request::Request;
use crate::master_key::state::{
    Blake2bMac256, RemoteSecret, RemoteSecretAuthenticationToken, RemoteSecretParameters,
};

/// The permanent client secret used to solve authentication challenges.
pub struct ClientKey(StaticSecret);

impl ClientKey {
    /// Creates a client key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Solves an authentication challenge issued by the server.
    ///
    /// The challenge key is derived from X25519(client key, server
    /// challenge public key) through a two-stage keyed BLAKE2b-256; the
    /// response is the MAC of the challenge bytes under that key.
    ///
    /// # Panics
    ///
    /// This function will not panic - the `expect`s cover key and salt
    /// lengths that are fixed at compile time.
    fn solve_challenge(&self, challenge_public_key: [u8; 32], challenge: &[u8]) -> [u8; 32] {
        let shared_secret = self.0.diffie_hellman(&PublicKey::from(challenge_public_key));
        let authentication_key =
            Blake2bMac256::new_with_salt_and_personal(shared_secret.as_bytes(), b"auth", b"keykitrs")
                .expect("key and salt lengths are fixed")
                .finalize()
                .into_bytes();
        Blake2bMac256::new_with_salt_and_personal(&authentication_key, &[], &[])
            .expect("key length is fixed")
            .chain_update(challenge)
            .finalize()
            .into_bytes()
            .into()
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Work credentials submitted with create and delete requests.
#[derive(Debug, Clone)]
pub struct WorkCredentials {
    /// License username.
    pub username: String,
    /// License password.
    pub password: String,
}

/// Everything the client needs to talk to the work server.
#[derive(Debug)]
pub struct RemoteSecretClientParameters {
    /// Base URL of the work server.
    pub work_server_base_url: String,
    /// The user's identity.
    pub user_identity: String,
    /// The permanent client key.
    pub client_key: ClientKey,
    /// Work credentials.
    pub credentials: WorkCredentials,
}

/// Result of creating a remote secret.
#[derive(Debug)]
pub struct RemoteSecretCreationResult {
    /// The freshly established secret.
    pub remote_secret: RemoteSecret,
    /// Parameters for monitoring and later revoking it.
    pub parameters: RemoteSecretParameters,
}

/// A fetched remote secret with its monitoring schedule.
#[derive(Debug)]
pub struct FetchedRemoteSecret {
    /// The current secret.
    pub remote_secret: RemoteSecret,
    /// Interval between monitor checks, in seconds.
    pub check_interval_s: u32,
    /// Consecutive failures tolerated before the secret must be treated
    /// as unavailable.
    pub n_missed_checks_max: u16,
}

fn remote_secret_url(base_url: &str) -> String {
    format!(
        "{}/api-client/v1/remote-secret",
        base_url.trim_end_matches('/')
    )
}

#[derive(Deserialize)]
struct UnauthorizedBody {
    code: Option<String>,
}

#[derive(Deserialize)]
struct ChallengeBody {
    #[serde(rename = "challengePublicKey")]
    challenge_public_key: String,
    challenge: String,
}

#[derive(Deserialize)]
struct CreatedBody {
    #[serde(rename = "secretAuthenticationToken")]
    secret_authentication_token: String,
}

#[derive(Deserialize)]
struct FetchBody {
    secret: String,
    #[serde(rename = "checkIntervalS")]
    check_interval_s: u32,
    #[serde(rename = "nMissedChecksMax")]
    n_missed_checks_max: u16,
}

fn decode_fixed<const N: usize>(
    value: &str,
    context: &'static str,
) -> Result<[u8; N], RemoteSecretEndpointError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| RemoteSecretEndpointError::Decoding(format!("invalid base64 in {context}")))?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| RemoteSecretEndpointError::Decoding(format!("invalid length of {context}")))
}

fn decode_body<T: serde::de::DeserializeOwned>(
    body: &[u8],
) -> Result<T, RemoteSecretEndpointError> {
    serde_json::from_slice(body)
        .map_err(|error| RemoteSecretEndpointError::Decoding(error.to_string()))
}

/// Maps the response status, distinguishing the 401 error codes; statuses
/// not covered by `unexpected_status_map` are protocol violations.
async fn handle_status(
    response: reqwest::Response,
    unexpected_status_map: fn(u16) -> Option<RemoteSecretEndpointError>,
) -> Result<Vec<u8>, RemoteSecretEndpointError> {
    let status = response.status().as_u16();
    let body = response.bytes().await?;
    match status {
        200 | 204 => Ok(body.to_vec()),
        401 => match decode_body::<UnauthorizedBody>(&body).ok().and_then(|b| b.code) {
            Some(code) if code == "challenge-expired" => {
                Err(RemoteSecretEndpointError::ChallengeExpired)
            }
            Some(code) if code == "invalid-challenge-response" => {
                Err(RemoteSecretEndpointError::InvalidChallengeResponse)
            }
            _ => Err(RemoteSecretEndpointError::InvalidCredentials),
        },
        429 => Err(RemoteSecretEndpointError::RateLimitExceeded),
        status => Err(unexpected_status_map(status)
            .unwrap_or(RemoteSecretEndpointError::UnexpectedStatus(status))),
    }
}

/// Client for the remote-secret endpoint of the work server.
pub struct RemoteSecretClient {
    request: Request,
}

impl Default for RemoteSecretClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteSecretClient {
    /// Creates a client with default HTTP settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request: Request::new(),
        }
    }

    /// Creates a new remote secret on the server.
    ///
    /// The secret itself is generated client-side and submitted with the
    /// request; the server answers the first round-trip with an
    /// authentication challenge and the second with the
    /// `secretAuthenticationToken` needed to fetch and revoke the secret.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteSecretEndpointError::InvalidCredentials`] when the
    /// server rejects the identity or credentials, or another endpoint
    /// error.
    pub async fn create_remote_secret(
        &self,
        parameters: &RemoteSecretClientParameters,
    ) -> Result<RemoteSecretCreationResult, RemoteSecretEndpointError> {
        let url = remote_secret_url(&parameters.work_server_base_url);
        let remote_secret = RemoteSecret::random();
        let base_request = json!({
            "identity": parameters.user_identity,
            "username": parameters.credentials.username,
            "password": parameters.credentials.password,
            "secret": BASE64.encode(remote_secret.as_bytes()),
        });

        info!("Requesting challenge to create remote secret");
        let response = self
            .request
            .handle(self.request.put(&url).json(&base_request))
            .await?;
        let challenge: ChallengeBody = decode_body(&handle_status(response, |_| None).await?)?;
        let challenge_public_key =
            decode_fixed::<32>(&challenge.challenge_public_key, "challengePublicKey")?;
        let challenge_bytes = BASE64.decode(&challenge.challenge).map_err(|_| {
            RemoteSecretEndpointError::Decoding("invalid base64 in challenge".to_string())
        })?;

        info!("Creating remote secret");
        let mut authenticated_request = base_request;
        authenticated_request["challenge"] = json!(challenge.challenge);
        authenticated_request["response"] = json!(BASE64.encode(
            parameters
                .client_key
                .solve_challenge(challenge_public_key, &challenge_bytes)
        ));
        let response = self
            .request
            .handle(self.request.put(&url).json(&authenticated_request))
            .await?;
        let created: CreatedBody = decode_body(&handle_status(response, |_| None).await?)?;
        let token =
            decode_fixed::<32>(&created.secret_authentication_token, "secretAuthenticationToken")?;

        let remote_secret_hash = remote_secret.derive_hash();
        Ok(RemoteSecretCreationResult {
            remote_secret,
            parameters: RemoteSecretParameters {
                authentication_token: RemoteSecretAuthenticationToken::from_bytes(token),
                remote_secret_hash,
            },
        })
    }

    /// Fetches the current remote secret. A single attempt; the monitor
    /// loop owns the retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteSecretEndpointError::Forbidden`] when access is
    /// blocked by the administrator,
    /// [`RemoteSecretEndpointError::NotFound`] when the secret was
    /// removed, or another endpoint error.
    pub async fn fetch_remote_secret(
        &self,
        work_server_base_url: &str,
        authentication_token: &RemoteSecretAuthenticationToken,
    ) -> Result<FetchedRemoteSecret, RemoteSecretEndpointError> {
        let url = remote_secret_url(work_server_base_url);
        let request = self.request.post(&url).json(&json!({
            "secretAuthenticationToken": BASE64.encode(authentication_token.as_bytes()),
        }));

        let response = self.request.execute(request).await?;
        let body = handle_status(response, |status| match status {
            403 => Some(RemoteSecretEndpointError::Forbidden),
            404 => Some(RemoteSecretEndpointError::NotFound),
            _ => None,
        })
        .await?;
        let fetch: FetchBody = decode_body(&body)?;
        let secret = decode_fixed::<REMOTE_SECRET_LENGTH>(&fetch.secret, "secret")?;

        Ok(FetchedRemoteSecret {
            remote_secret: RemoteSecret::from_bytes(secret),
            check_interval_s: fetch.check_interval_s,
            n_missed_checks_max: fetch.n_missed_checks_max,
        })
    }

    /// Revokes a remote secret on the server, with the same
    /// challenge-response authentication as creation.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteSecretEndpointError::InvalidCredentials`] when the
    /// server rejects the identity or credentials, or another endpoint
    /// error.
    pub async fn delete_remote_secret(
        &self,
        parameters: &RemoteSecretClientParameters,
        authentication_token: &RemoteSecretAuthenticationToken,
    ) -> Result<(), RemoteSecretEndpointError> {
        let url = remote_secret_url(&parameters.work_server_base_url);
        let base_request = json!({
            "identity": parameters.user_identity,
            "username": parameters.credentials.username,
            "password": parameters.credentials.password,
            "secretAuthenticationToken": BASE64.encode(authentication_token.as_bytes()),
        });

        info!("Requesting challenge to delete remote secret");
        let response = self
            .request
            .handle(self.request.delete(&url).json(&base_request))
            .await?;
        let challenge: ChallengeBody = decode_body(&handle_status(response, |_| None).await?)?;
        let challenge_public_key =
            decode_fixed::<32>(&challenge.challenge_public_key, "challengePublicKey")?;
        let challenge_bytes = BASE64.decode(&challenge.challenge).map_err(|_| {
            RemoteSecretEndpointError::Decoding("invalid base64 in challenge".to_string())
        })?;

        info!("Deleting remote secret");
        let mut authenticated_request = base_request;
        authenticated_request["challenge"] = json!(challenge.challenge);
        authenticated_request["response"] = json!(BASE64.encode(
            parameters
                .client_key
                .solve_challenge(challenge_public_key, &challenge_bytes)
        ));
        let response = self
            .request
            .handle(self.request.delete(&url).json(&authenticated_request))
            .await?;
        let _ = handle_status(response, |_| None).await?;
        Ok(())
    }
}
