//! Snapshotter secret resolution.
//!
//! A class may name the secret the backend needs through two parameters,
//! [`PARAM_SECRET_NAME`] and [`PARAM_SECRET_NAMESPACE`].  Their values are
//! templates over the objects involved in the operation:
//!
//! | token | name template | namespace template |
//! |---|---|---|
//! | `${volumesnapshotcontent.name}` | yes | yes |
//! | `${volumesnapshot.namespace}` | yes | yes |
//! | `${volumesnapshot.name}` | yes | no |
//!
//! Resolved namespaces must be DNS-1123 labels and resolved names DNS-1123
//! subdomains.  Every parameter under [`RESERVED_PARAM_PREFIX`] is stripped
//! before the parameters reach the backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::backend::Secrets;
use crate::error::{Result, SnapshotError};

pub const RESERVED_PARAM_PREFIX: &str = "csi.storage.k8s.io/";
pub const PARAM_SECRET_NAME: &str = "csi.storage.k8s.io/snapshotter-secret-name";
pub const PARAM_SECRET_NAMESPACE: &str = "csi.storage.k8s.io/snapshotter-secret-namespace";

const TOKEN_CONTENT_NAME: &str = "volumesnapshotcontent.name";
const TOKEN_REQUEST_NAME: &str = "volumesnapshot.name";
const TOKEN_REQUEST_NAMESPACE: &str = "volumesnapshot.namespace";

/// A resolved secret location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

/// Object names available to templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub content_name: String,
    pub request_name: Option<String>,
    pub request_namespace: Option<String>,
}

/// Fetches secret data.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secrets>;
}

/// Copy of `params` without controller-reserved keys.
pub fn strip_reserved_parameters(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    params
        .iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_PARAM_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Resolve the secret reference named by `params`.
///
/// `Ok(None)` when neither parameter is present.  Setting only one of the
/// two is an error.
pub fn resolve_secret_ref(
    params: &BTreeMap<String, String>,
    ctx: &TemplateContext,
) -> Result<Option<SecretRef>> {
    let (name_tmpl, ns_tmpl) = match (
        params.get(PARAM_SECRET_NAME),
        params.get(PARAM_SECRET_NAMESPACE),
    ) {
        (None, None) => return Ok(None),
        (Some(name), Some(ns)) => (name, ns),
        _ => {
            return Err(SnapshotError::Secret(format!(
                "either both or neither of {PARAM_SECRET_NAME} and {PARAM_SECRET_NAMESPACE} must be set"
            )));
        }
    };

    let namespace = substitute(ns_tmpl, |token| match token {
        TOKEN_CONTENT_NAME => Some(ctx.content_name.clone()),
        TOKEN_REQUEST_NAMESPACE => ctx.request_namespace.clone(),
        _ => None,
    })?;
    if !is_dns1123_label(&namespace) {
        return Err(SnapshotError::Secret(format!(
            "{PARAM_SECRET_NAMESPACE} {ns_tmpl:?} resolved to {namespace:?}, which is not a valid namespace"
        )));
    }

    let name = substitute(name_tmpl, |token| match token {
        TOKEN_CONTENT_NAME => Some(ctx.content_name.clone()),
        TOKEN_REQUEST_NAME => ctx.request_name.clone(),
        TOKEN_REQUEST_NAMESPACE => ctx.request_namespace.clone(),
        _ => None,
    })?;
    if !is_dns1123_subdomain(&name) {
        return Err(SnapshotError::Secret(format!(
            "{PARAM_SECRET_NAME} {name_tmpl:?} resolved to {name:?}, which is not a valid secret name"
        )));
    }

    Ok(Some(SecretRef { namespace, name }))
}

/// Replace every `${token}` in `template` using `lookup`.
fn substitute<F>(template: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(SnapshotError::Secret(format!(
                "unterminated token in template {template:?}"
            )));
        };
        let token = &after[..end];
        let value = lookup(token).ok_or_else(|| {
            SnapshotError::Secret(format!(
                "template {template:?} uses unknown or unavailable token ${{{token}}}"
            ))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_dns1123_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
}

fn is_dns1123_subdomain(s: &str) -> bool {
    !s.is_empty() && s.len() <= 253 && s.split('.').all(is_dns1123_label)
}

/// Resolves templates and fetches the referenced secret.
pub struct SecretResolver<S: ?Sized> {
    source: std::sync::Arc<S>,
}

impl<S: SecretSource + ?Sized> SecretResolver<S> {
    pub fn new(source: std::sync::Arc<S>) -> Self {
        Self { source }
    }

    /// Resolve the reference in `params` and fetch its data.  No reference
    /// means no secrets.
    pub async fn resolve(
        &self,
        params: &BTreeMap<String, String>,
        ctx: &TemplateContext,
    ) -> Result<(Option<SecretRef>, Secrets)> {
        let Some(secret_ref) = resolve_secret_ref(params, ctx)? else {
            return Ok((None, Secrets::new()));
        };
        let secrets = self.fetch(&secret_ref).await?;
        Ok((Some(secret_ref), secrets))
    }

    /// Fetch the secret `secret_ref` names.
    pub async fn fetch(&self, secret_ref: &SecretRef) -> Result<Secrets> {
        debug!(namespace = %secret_ref.namespace, name = %secret_ref.name, "fetching secret");
        self.source
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await
    }
}

/// In-memory [`SecretSource`].
#[derive(Debug, Default)]
pub struct MemorySecretSource {
    secrets: DashMap<(String, String), Secrets>,
}

impl MemorySecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a secret.
    pub fn insert(&self, namespace: &str, name: &str, data: Secrets) {
        self.secrets
            .insert((namespace.to_owned(), name.to_owned()), data);
    }
}

#[async_trait]
impl SecretSource for MemorySecretSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secrets> {
        self.secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|s| s.clone())
            .ok_or_else(|| SnapshotError::Secret(format!("secret {namespace}/{name} not found")))
    }
}
