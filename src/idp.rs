//! C4: identity provider bootstrap — reconciles the Keycloak-compatible IDP
//! against the master configuration via its admin REST API, idempotently.
use crate::{
    constants::{IDP_BOOTSTRAP_BACKOFF, IDP_BOOTSTRAP_RETRIES, IDP_PERMISSION_GROUPS},
    error::IdpError,
    master_config::{IdentityProviderConfig, MasterConfig},
};
use serde_json::{json, Value};
use std::thread;

/// Admin REST client for the identity provider, scoped to one realm.
pub struct IdpClient {
    http: reqwest::blocking::Client,
    base_url: String,
    admin_user: String,
    admin_password: String,
}

impl IdpClient {
    pub fn new(base_url: impl Into<String>, admin_user: impl Into<String>, admin_password: impl Into<String>) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
            admin_user: admin_user.into(),
            admin_password: admin_password.into(),
        }
    }

    fn admin_token(&self) -> Result<String, IdpError> {
        let url = format!("{}/realms/master/protocol/openid-connect/token", self.base_url);
        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
                ("username", &self.admin_user),
                ("password", &self.admin_password),
            ])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(IdpError::UnexpectedStatus {
                step: "admin_token".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json()?;
        payload
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IdpError::UnexpectedStatus {
                step: "admin_token".to_string(),
                status: status.as_u16(),
                body: payload.to_string(),
            })
    }

    /// Ensures the target realm exists, creating it if absent.
    pub fn ensure_realm(&self, token: &str, realm: &str) -> Result<(), IdpError> {
        let check_url = format!("{}/admin/realms/{realm}", self.base_url);
        let exists = self
            .http
            .get(&check_url)
            .bearer_auth(token)
            .send()?
            .status()
            .is_success();
        if exists {
            return Ok(());
        }

        let create_url = format!("{}/admin/realms", self.base_url);
        let response = self
            .http
            .post(create_url)
            .bearer_auth(token)
            .json(&json!({ "realm": realm, "enabled": true }))
            .send()?;
        ensure_success(&response, "ensure_realm")
    }

    /// Ensures the confidential client exists for this realm and returns
    /// its generated secret, creating the client if it is missing.
    pub fn ensure_client(&self, token: &str, realm: &str, client_id: &str) -> Result<String, IdpError> {
        let list_url = format!("{}/admin/realms/{realm}/clients?clientId={client_id}", self.base_url);
        let existing: Vec<Value> = self.http.get(&list_url).bearer_auth(token).send()?.json()?;

        let client_uuid = if let Some(found) = existing.first() {
            found.get("id").and_then(Value::as_str).map(str::to_string)
        } else {
            let create_url = format!("{}/admin/realms/{realm}/clients", self.base_url);
            let response = self
                .http
                .post(create_url)
                .bearer_auth(token)
                .json(&json!({
                    "clientId": client_id,
                    "enabled": true,
                    "publicClient": false,
                    "serviceAccountsEnabled": true,
                    "directAccessGrantsEnabled": true,
                }))
                .send()?;
            ensure_success(&response, "ensure_client.create")?;
            None
        };

        let client_uuid = match client_uuid {
            Some(id) => id,
            None => {
                let lookup: Vec<Value> = self.http.get(&list_url).bearer_auth(token).send()?.json()?;
                lookup
                    .first()
                    .and_then(|v| v.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| IdpError::UnexpectedStatus {
                        step: "ensure_client.lookup".to_string(),
                        status: 0,
                        body: "client not found after creation".to_string(),
                    })?
            }
        };

        let secret_url = format!(
            "{}/admin/realms/{realm}/clients/{client_uuid}/client-secret",
            self.base_url
        );
        let secret_response = self.http.get(&secret_url).bearer_auth(token).send()?;
        ensure_success(&secret_response, "ensure_client.secret")?;
        let secret_payload: Value = secret_response.json()?;
        secret_payload
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IdpError::UnexpectedStatus {
                step: "ensure_client.secret".to_string(),
                status: 0,
                body: "client secret missing from response".to_string(),
            })
    }

    /// Ensures the four permission groups exist, along with a protocol
    /// mapper that surfaces group membership as a `groups` token claim.
    pub fn ensure_groups(&self, token: &str, realm: &str, client_id: &str) -> Result<(), IdpError> {
        let groups_url = format!("{}/admin/realms/{realm}/groups", self.base_url);
        let existing: Vec<Value> = self.http.get(&groups_url).bearer_auth(token).send()?.json()?;
        let existing_names: Vec<String> = existing
            .iter()
            .filter_map(|g| g.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        for group in IDP_PERMISSION_GROUPS {
            if existing_names.iter().any(|n| n == group) {
                continue;
            }
            let response = self
                .http
                .post(&groups_url)
                .bearer_auth(token)
                .json(&json!({ "name": group }))
                .send()?;
            ensure_success(&response, "ensure_groups.create")?;
        }

        self.ensure_group_membership_mapper(token, realm, client_id)
    }

    /// Looks up a client's internal UUID from its `clientId`.
    fn client_uuid(&self, token: &str, realm: &str, client_id: &str) -> Result<String, IdpError> {
        let list_url = format!("{}/admin/realms/{realm}/clients?clientId={client_id}", self.base_url);
        let existing: Vec<Value> = self.http.get(&list_url).bearer_auth(token).send()?.json()?;
        existing
            .first()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IdpError::UnexpectedStatus {
                step: "client_uuid".to_string(),
                status: 0,
                body: format!("client '{client_id}' not found"),
            })
    }

    /// Adds a `oidc-group-membership-mapper` to the client so its issued
    /// tokens carry a `groups` claim, unless one is already present.
    fn ensure_group_membership_mapper(&self, token: &str, realm: &str, client_id: &str) -> Result<(), IdpError> {
        let client_uuid = self.client_uuid(token, realm, client_id)?;
        let mappers_url = format!(
            "{}/admin/realms/{realm}/clients/{client_uuid}/protocol-mappers/models",
            self.base_url
        );
        let existing: Vec<Value> = self.http.get(&mappers_url).bearer_auth(token).send()?.json()?;
        let already_present = existing
            .iter()
            .any(|m| m.get("protocolMapper").and_then(Value::as_str) == Some("oidc-group-membership-mapper"));
        if already_present {
            return Ok(());
        }

        let response = self
            .http
            .post(&mappers_url)
            .bearer_auth(token)
            .json(&json!({
                "name": "groups",
                "protocol": "openid-connect",
                "protocolMapper": "oidc-group-membership-mapper",
                "config": {
                    "full.path": "false",
                    "id.token.claim": "true",
                    "access.token.claim": "true",
                    "claim.name": "groups",
                    "userinfo.token.claim": "true",
                },
            }))
            .send()?;
        ensure_success(&response, "ensure_group_membership_mapper.create")
    }

    /// Ensures a bootstrap admin user exists and belongs to the `admins` group.
    pub fn ensure_admin_user(&self, token: &str, realm: &str, username: &str, password: &str) -> Result<(), IdpError> {
        let users_url = format!("{}/admin/realms/{realm}/users?username={username}", self.base_url);
        let existing: Vec<Value> = self.http.get(&users_url).bearer_auth(token).send()?.json()?;

        if !existing.is_empty() {
            return Ok(());
        }

        let create_url = format!("{}/admin/realms/{realm}/users", self.base_url);
        let response = self
            .http
            .post(create_url)
            .bearer_auth(token)
            .json(&json!({
                "username": username,
                "enabled": true,
                "credentials": [{ "type": "password", "value": password, "temporary": false }],
                "groups": ["/admins"],
            }))
            .send()?;
        ensure_success(&response, "ensure_admin_user.create")
    }

    /// Points the realm's `frontendUrl` at the new hostname, preserving
    /// every other realm attribute already on file.
    pub fn update_realm_frontend_url(&self, token: &str, realm: &str, frontend_url: &str) -> Result<(), IdpError> {
        let realm_url = format!("{}/admin/realms/{realm}", self.base_url);
        let mut representation: Value = self.http.get(&realm_url).bearer_auth(token).send()?.json()?;
        representation["attributes"]["frontendUrl"] = Value::String(frontend_url.to_string());

        let response = self.http.put(&realm_url).bearer_auth(token).json(&representation).send()?;
        ensure_success(&response, "update_realm_frontend_url")
    }

    /// Replaces the client's redirect URIs with the localhost and external
    /// hostname forms, without touching any other client attribute.
    pub fn update_client_redirect_uris(&self, token: &str, realm: &str, client_id: &str, redirect_uris: &[String]) -> Result<(), IdpError> {
        let list_url = format!("{}/admin/realms/{realm}/clients?clientId={client_id}", self.base_url);
        let existing: Vec<Value> = self.http.get(&list_url).bearer_auth(token).send()?.json()?;
        let Some(found) = existing.first() else {
            return Err(IdpError::UnexpectedStatus {
                step: "update_client_redirect_uris".to_string(),
                status: 0,
                body: format!("client '{client_id}' not found"),
            });
        };
        let client_uuid = found
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| IdpError::UnexpectedStatus {
                step: "update_client_redirect_uris".to_string(),
                status: 0,
                body: "client representation missing id".to_string(),
            })?;

        let client_url = format!("{}/admin/realms/{realm}/clients/{client_uuid}", self.base_url);
        let mut representation: Value = self.http.get(&client_url).bearer_auth(token).send()?.json()?;
        representation["redirectUris"] = Value::Array(redirect_uris.iter().cloned().map(Value::String).collect());

        let response = self.http.put(&client_url).bearer_auth(token).json(&representation).send()?;
        ensure_success(&response, "update_client_redirect_uris")
    }

    /// Runs every reconcile step in order, retrying each independently.
    pub fn bootstrap(&self, realm: &str, client_id: &str, admin_user: &str, admin_password: &str) -> Result<String, IdpError> {
        let token = with_retries("admin_token", || self.admin_token())?;
        with_retries("ensure_realm", || self.ensure_realm(&token, realm))?;
        let secret = with_retries("ensure_client", || self.ensure_client(&token, realm, client_id))?;
        with_retries("ensure_groups", || self.ensure_groups(&token, realm, client_id))?;
        with_retries("ensure_admin_user", || {
            self.ensure_admin_user(&token, realm, admin_user, admin_password)
        })?;
        Ok(secret)
    }
}

fn ensure_success(response: &reqwest::blocking::Response, step: &str) -> Result<(), IdpError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(IdpError::UnexpectedStatus {
            step: step.to_string(),
            status: response.status().as_u16(),
            body: String::new(),
        })
    }
}

fn with_retries<T>(step: &str, mut f: impl FnMut() -> Result<T, IdpError>) -> Result<T, IdpError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempts >= IDP_BOOTSTRAP_RETRIES {
                    return Err(IdpError::RetriesExhausted {
                        step: step.to_string(),
                        attempts,
                        source: Box::new(err),
                    });
                }
                thread::sleep(IDP_BOOTSTRAP_BACKOFF);
            }
        }
    }
}

/// Whether the identity provider needs to be (re)bootstrapped: it is
/// missing entirely from the master configuration.
pub fn needs_bootstrap(master: &MasterConfig) -> bool {
    master.identity_provider.is_none()
}

/// Runs the full bootstrap flow against a running IDP and writes the
/// resulting connection details back into the master configuration.
pub fn bootstrap_and_record(master: &mut MasterConfig, idp_port: u16, idp_base_url: &str) -> Result<(), IdpError> {
    let realm = "hivematrix";
    let client_id = "helm";
    let admin_user = "admin";
    let admin_password = "admin";

    let client = IdpClient::new(idp_base_url, admin_user, admin_password);
    let secret = client.bootstrap(realm, client_id, admin_user, admin_password)?;

    master.set_identity_provider(IdentityProviderConfig {
        backend_url: idp_base_url.to_string(),
        realm: realm.to_string(),
        client_id: client_id.to_string(),
        client_secret: secret,
        admin_user: admin_user.to_string(),
        admin_password: admin_password.to_string(),
        port: idp_port,
    });
    Ok(())
}

/// Re-bootstraps after a hostname change: the realm's `frontendUrl` and the
/// client's redirect URIs move to the new host, but the client itself is
/// never recreated and its secret is never rotated (spec.md §4.4's hostname
/// change sub-case).
pub fn rebootstrap_for_hostname_change(master: &mut MasterConfig, new_hostname: &str) -> Result<(), IdpError> {
    let Some(idp) = master.identity_provider.clone() else {
        return Ok(());
    };

    let client = IdpClient::new(&idp.backend_url, &idp.admin_user, &idp.admin_password);
    let token = with_retries("admin_token", || client.admin_token())?;
    with_retries("ensure_realm", || client.ensure_realm(&token, &idp.realm))?;

    let frontend_url = format!("https://{new_hostname}");
    with_retries("update_realm_frontend_url", || {
        client.update_realm_frontend_url(&token, &idp.realm, &frontend_url)
    })?;

    let redirect_uris = vec![
        "http://localhost/*".to_string(),
        "http://127.0.0.1/*".to_string(),
        format!("https://{new_hostname}/*"),
    ];
    with_retries("update_client_redirect_uris", || {
        client.update_client_redirect_uris(&token, &idp.realm, &idp.client_id, &redirect_uris)
    })?;

    Ok(())
}
