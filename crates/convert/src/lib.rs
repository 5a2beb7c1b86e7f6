//! Keel version control: converts resources between declared schema versions
//! so that only the definition's storage version ever reaches the store.
//!
//! Single attempt per call; webhook failures are logged and propagated,
//! never retried at this layer.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use keel_core::problem::problems;
use keel_core::{
    ConversionStrategy, Error, Resource, ResourceDefinitionSpec, ResourceReference, Result,
};

const CONVERSION_API_VERSION: &str = "conversion.keel.io/v1";
const CONVERSION_KIND: &str = "ConversionReview";

/// Everything a conversion step needs: where the resource lives, what its
/// definition declares, and the instance being converted.
#[derive(Debug, Clone)]
pub struct VersioningContext {
    pub reference: ResourceReference,
    pub definition: ResourceDefinitionSpec,
    pub resource: Resource,
}

impl VersioningContext {
    pub fn new(reference: ResourceReference, definition: ResourceDefinitionSpec, resource: Resource) -> Self {
        Self { reference, definition, resource }
    }
}

/// Wire envelope POSTed to conversion webhook endpoints and echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversionReview {
    api_version: String,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<ConversionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<ConversionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversionRequest {
    uid: String,
    desired_api_version: String,
    objects: Vec<Resource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversionResponse {
    uid: String,
    result: ConversionResult,
    #[serde(default)]
    converted_objects: Vec<Resource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversionResult {
    success: bool,
    #[serde(default)]
    errors: Vec<String>,
}

/// Converts resources to their definition's storage version.
#[derive(Default, Clone)]
pub struct VersionConverter {
    http: reqwest::Client,
}

impl VersionConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resource in storage version, updating `ctx.resource` in
    /// place when a conversion step ran.
    pub async fn convert_to_storage_version(&self, ctx: &mut VersioningContext) -> Result<Resource> {
        let strategy = ctx.definition.conversion.as_ref().map(|c| c.strategy);
        if matches!(strategy, None | Some(ConversionStrategy::None)) {
            return Ok(ctx.resource.clone());
        }

        let claimed = ctx.resource.version().to_string();
        if ctx.definition.version(&claimed).is_none() {
            return Err(Error::Problem(problems::resource_version_not_found(&ctx.reference, &claimed)));
        }
        let storage = ctx.definition.storage_version().ok_or_else(|| {
            Error::Problem(problems::storage_version_not_found(&ctx.definition.group, &ctx.definition.names.plural))
        })?;
        if claimed == storage.name {
            return Ok(ctx.resource.clone());
        }

        match strategy {
            Some(ConversionStrategy::Webhook) => {
                let target = keel_core::api_version(&ctx.definition.group, &storage.name);
                let converted = self.convert_via_webhook(ctx, &target).await?;
                ctx.resource = converted.clone();
                Ok(converted)
            }
            // Guarded above; kept for exhaustiveness if strategies grow.
            _ => Err(Error::Internal(format!(
                "unsupported conversion strategy {strategy:?} for '{}'",
                ctx.reference
            ))),
        }
    }

    async fn convert_via_webhook(&self, ctx: &VersioningContext, target_api_version: &str) -> Result<Resource> {
        let webhook = ctx
            .definition
            .conversion
            .as_ref()
            .and_then(|c| c.webhook.as_ref())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "definition '{}' declares webhook conversion but no webhook client",
                    ctx.definition.qualified_plural()
                ))
            })?;
        let uid = uuid::Uuid::new_v4().to_string();
        let review = ConversionReview {
            api_version: CONVERSION_API_VERSION.to_string(),
            kind: CONVERSION_KIND.to_string(),
            request: Some(ConversionRequest {
                uid: uid.clone(),
                desired_api_version: target_api_version.to_string(),
                objects: vec![ctx.resource.clone()],
            }),
            response: None,
        };
        debug!(reference = %ctx.reference, target = %target_api_version, url = %webhook.url, "convert: webhook call");
        let response = self
            .http
            .post(&webhook.url)
            .json(&review)
            .send()
            .await
            .map_err(|e| Error::Webhook(format!("posting conversion review to '{}': {e}", webhook.url)))?;
        if !response.status().is_success() {
            warn!(reference = %ctx.reference, status = %response.status(), "convert: webhook returned non-success status");
            return Err(Error::Webhook(format!(
                "conversion webhook '{}' answered review '{uid}' with status {}",
                webhook.url,
                response.status()
            )));
        }
        let body: ConversionReview = response
            .json()
            .await
            .map_err(|e| Error::Webhook(format!("decoding conversion review from '{}': {e}", webhook.url)))?;

        let failed = |errors: &[String]| {
            Error::Problem(problems::resource_conversion_failed(&ctx.reference, target_api_version, errors))
        };
        let converted = match body.response {
            Some(r) if r.uid == uid => {
                if !r.result.success {
                    warn!(reference = %ctx.reference, errors = ?r.result.errors, "convert: webhook reported failure");
                    return Err(failed(&r.result.errors));
                }
                r.converted_objects.into_iter().next().ok_or_else(|| {
                    failed(&["webhook reported success but returned no converted object".to_string()])
                })?
            }
            _ => return Err(failed(&["missing or mismatched conversion response".to_string()])),
        };
        Ok(converted)
    }
}
