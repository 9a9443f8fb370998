//! # Record Store
//!
//! Named fields on a CRM record, shared between this client and the external
//! workflow. The workflow reports completion by writing a field (for example
//! the generated contract URL); the poller reads it back.
//!
//! [`CrmRecordStore::list_attachments`] also lists the files attached to a
//! record, which is where upload actions pick their `attachmentId` from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::oauth::TokenBroker;

/// Field name to value. Absent or empty means "not populated".
pub type FieldMap = BTreeMap<String, String>;

pub const HUBSPOT_API_BASE: &str = "https://api.hubapi.com";

/// Read/write access to fields of one record scoped by tenant.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read_fields(
        &self,
        tenant_id: &str,
        target_id: &str,
        fields: &[String],
    ) -> Result<FieldMap>;

    async fn write_fields(&self, tenant_id: &str, target_id: &str, fields: &FieldMap)
        -> Result<()>;
}

/// HubSpot CRM v3 objects API.
pub struct CrmRecordStore {
    http: reqwest::Client,
    base_url: String,
    object_type: String,
    broker: Arc<dyn TokenBroker>,
}

#[derive(Deserialize)]
struct CrmObject {
    #[serde(default)]
    properties: HashMap<String, Option<String>>,
}

/// Record property holding `;`-separated file ids.
pub const ATTACHMENT_IDS_FIELD: &str = "hs_attachment_ids";

/// A file attached to a CRM record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub extension: String,
    pub size: Option<u64>,
}

impl Attachment {
    /// Placeholder used when the file's metadata can't be read.
    fn unnamed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("Attachment {}", id),
            extension: String::new(),
            size: None,
        }
    }
}

#[derive(Deserialize)]
struct SearchResults {
    #[serde(default)]
    results: Vec<CrmObject>,
}

#[derive(Deserialize)]
struct AssociationResults {
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Deserialize)]
struct FileMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    extension: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

fn split_ids(raw: &str, into: &mut Vec<String>) {
    for id in raw.split(';').map(str::trim).filter(|id| !id.is_empty()) {
        if !into.iter().any(|known| known == id) {
            into.push(id.to_string());
        }
    }
}

impl CrmRecordStore {
    /// Store for `deals` at the public HubSpot API.
    pub fn new(broker: Arc<dyn TokenBroker>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: HUBSPOT_API_BASE.to_string(),
            object_type: "deals".to_string(),
            broker,
        }
    }

    /// Override the base URL (for testing with wiremock).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_object_type(mut self, object_type: &str) -> Self {
        self.object_type = object_type.to_string();
        self
    }

    fn object_url(&self, target_id: &str) -> String {
        format!(
            "{}/crm/v3/objects/{}/{}",
            self.base_url, self.object_type, target_id
        )
    }

    /// Singular association name used by the search API.
    fn association_name(&self) -> &str {
        match self.object_type.as_str() {
            "deals" => "deal",
            "companies" => "company",
            "contacts" => "contact",
            "tickets" => "ticket",
            other => other,
        }
    }

    /// Files attached to the record.
    ///
    /// Ids come from the first source that yields any: engagements
    /// associated with the record, direct file associations, then the
    /// record's own `hs_attachment_ids`. A failing source is logged and the
    /// next one tried. Files whose metadata can't be read are still listed
    /// under a generic name.
    pub async fn list_attachments(&self, tenant_id: &str, target_id: &str) -> Result<Vec<Attachment>> {
        let token = self.broker.access_token(tenant_id).await?;

        let mut ids = self
            .engagement_attachment_ids(&token, target_id)
            .await
            .unwrap_or_else(|e| {
                warn!(tenant = tenant_id, record = target_id, error = %e, "engagement search failed");
                Vec::new()
            });

        if ids.is_empty() {
            ids = self
                .associated_file_ids(&token, target_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(tenant = tenant_id, record = target_id, error = %e, "file associations failed");
                    Vec::new()
                });
        }

        if ids.is_empty() {
            ids = self
                .read_fields(tenant_id, target_id, &[ATTACHMENT_IDS_FIELD.to_string()])
                .await
                .map(|fields| {
                    let mut ids = Vec::new();
                    if let Some(raw) = fields.get(ATTACHMENT_IDS_FIELD) {
                        split_ids(raw, &mut ids);
                    }
                    ids
                })
                .unwrap_or_else(|e| {
                    warn!(tenant = tenant_id, record = target_id, error = %e, "attachment property read failed");
                    Vec::new()
                });
        }

        debug!(tenant = tenant_id, record = target_id, count = ids.len(), "attachment ids resolved");

        let mut attachments = Vec::with_capacity(ids.len());
        for id in &ids {
            let attachment = match self.file_metadata(&token, id).await {
                Ok(attachment) => attachment,
                Err(e) => {
                    warn!(tenant = tenant_id, file = %id, error = %e, "file metadata unavailable");
                    Attachment::unnamed(id)
                }
            };
            attachments.push(attachment);
        }

        Ok(attachments)
    }

    async fn engagement_attachment_ids(&self, token: &str, target_id: &str) -> Result<Vec<String>> {
        let resp = self
            .http
            .post(format!("{}/crm/v3/objects/engagements/search", self.base_url))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "filterGroups": [{
                    "filters": [{
                        "propertyName": format!("associations.{}", self.association_name()),
                        "operator": "EQ",
                        "value": target_id,
                    }]
                }],
                "properties": [ATTACHMENT_IDS_FIELD, "hs_engagement_type"],
                "limit": 100,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Storage(format!(
                "engagement search failed ({status}): {body}"
            )));
        }

        let mut ids = Vec::new();
        for engagement in resp.json::<SearchResults>().await?.results {
            if let Some(Some(raw)) = engagement.properties.get(ATTACHMENT_IDS_FIELD) {
                split_ids(raw, &mut ids);
            }
        }
        Ok(ids)
    }

    async fn associated_file_ids(&self, token: &str, target_id: &str) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(format!(
                "{}/crm/v4/objects/{}/{}/associations/files",
                self.base_url, self.object_type, target_id
            ))
            .bearer_auth(token)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Storage(format!(
                "file associations failed ({status}): {body}"
            )));
        }

        Ok(resp
            .json::<AssociationResults>()
            .await?
            .results
            .iter()
            .filter_map(|result| {
                let id = result.get("toObjectId").or_else(|| result.get("id"))?;
                match id {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }
            })
            .collect())
    }

    async fn file_metadata(&self, token: &str, file_id: &str) -> Result<Attachment> {
        let resp = self
            .http
            .get(format!("{}/files/v3/files/{}", self.base_url, file_id))
            .bearer_auth(token)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 403 {
                warn!(file = file_id, "files scope missing; the app must be reinstalled");
            }
            return Err(RelayError::Storage(format!(
                "file {file_id} lookup failed ({status}): {body}"
            )));
        }

        let meta = resp.json::<FileMetadata>().await?;
        Ok(Attachment {
            id: file_id.to_string(),
            name: meta.name.unwrap_or_else(|| format!("File {}", file_id)),
            extension: meta.extension.unwrap_or_default(),
            size: meta.size,
        })
    }
}

#[async_trait]
impl RecordStore for CrmRecordStore {
    async fn read_fields(
        &self,
        tenant_id: &str,
        target_id: &str,
        fields: &[String],
    ) -> Result<FieldMap> {
        let token = self.broker.access_token(tenant_id).await?;

        let resp = self
            .http
            .get(self.object_url(target_id))
            .bearer_auth(&token)
            .query(&[("properties", fields.join(","))])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Storage(format!(
                "read {} {} failed ({status}): {body}",
                self.object_type, target_id
            )));
        }

        let object = resp.json::<CrmObject>().await?;
        Ok(object
            .properties
            .into_iter()
            .filter(|(name, _)| fields.iter().any(|f| f == name))
            .filter_map(|(name, value)| value.filter(|v| !v.is_empty()).map(|v| (name, v)))
            .collect())
    }

    async fn write_fields(
        &self,
        tenant_id: &str,
        target_id: &str,
        fields: &FieldMap,
    ) -> Result<()> {
        let token = self.broker.access_token(tenant_id).await?;

        let resp = self
            .http
            .patch(self.object_url(target_id))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "properties": fields }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Storage(format!(
                "update {} {} failed ({status}): {body}",
                self.object_type, target_id
            )));
        }

        Ok(())
    }
}

/// Process-local record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<(String, String), FieldMap>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one field, as the external workflow would.
    pub fn set_field(&self, tenant_id: &str, target_id: &str, name: &str, value: &str) {
        if let Ok(mut records) = self.records.write() {
            records
                .entry((tenant_id.to_string(), target_id.to_string()))
                .or_default()
                .insert(name.to_string(), value.to_string());
        }
    }

    pub fn fields(&self, tenant_id: &str, target_id: &str) -> FieldMap {
        self.records
            .read()
            .ok()
            .and_then(|r| r.get(&(tenant_id.to_string(), target_id.to_string())).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn read_fields(
        &self,
        tenant_id: &str,
        target_id: &str,
        fields: &[String],
    ) -> Result<FieldMap> {
        Ok(self
            .fields(tenant_id, target_id)
            .into_iter()
            .filter(|(name, value)| !value.is_empty() && fields.iter().any(|f| f == name))
            .collect())
    }

    async fn write_fields(
        &self,
        tenant_id: &str,
        target_id: &str,
        fields: &FieldMap,
    ) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| RelayError::Storage("record map lock poisoned".to_string()))?;
        records
            .entry((tenant_id.to_string(), target_id.to_string()))
            .or_default()
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_json, body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticBroker;

    #[async_trait]
    impl TokenBroker for StaticBroker {
        async fn access_token(&self, tenant_id: &str) -> Result<String> {
            match tenant_id {
                "147788687" => Ok("crm-token".to_string()),
                other => Err(RelayError::NotAuthorized(other.to_string())),
            }
        }

        async fn is_connected(&self, tenant_id: &str) -> bool {
            tenant_id == "147788687"
        }
    }

    fn names(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    async fn setup() -> (MockServer, CrmRecordStore) {
        let server = MockServer::start().await;
        let store = CrmRecordStore::new(Arc::new(StaticBroker)).with_base_url(&server.uri());
        (server, store)
    }

    #[tokio::test]
    async fn test_crm_read_drops_null_and_empty_properties() {
        let (server, store) = setup().await;

        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/deals/9001"))
            .and(query_param(
                "properties",
                "luminance_contract_url,luminance_contract_id,luminance_contract_status",
            ))
            .and(bearer_token("crm-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "9001",
                "properties": {
                    "luminance_contract_url": "https://docs.example.com/c/1",
                    "luminance_contract_id": null,
                    "luminance_contract_status": "",
                    "hs_object_id": "9001"
                }
            })))
            .mount(&server)
            .await;

        let fields = store
            .read_fields(
                "147788687",
                "9001",
                &names(&[
                    "luminance_contract_url",
                    "luminance_contract_id",
                    "luminance_contract_status",
                ]),
            )
            .await
            .unwrap();

        assert_eq!(fields.len(), 1);
        assert_eq!(fields["luminance_contract_url"], "https://docs.example.com/c/1");
    }

    #[tokio::test]
    async fn test_crm_read_error_is_storage() {
        let (server, store) = setup().await;

        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/deals/404"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let err = store
            .read_fields("147788687", "404", &names(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Storage(_)));
    }

    #[tokio::test]
    async fn test_crm_read_without_token_is_not_authorized() {
        let (_server, store) = setup().await;
        let err = store.read_fields("unknown", "1", &names(&["x"])).await.unwrap_err();
        assert!(matches!(err, RelayError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_crm_write_patches_properties() {
        let (server, store) = setup().await;

        Mock::given(method("PATCH"))
            .and(path("/crm/v3/objects/deals/9001"))
            .and(bearer_token("crm-token"))
            .and(body_json(json!({
                "properties": {"luminance_trigger_action": "generate"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "9001"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut fields = FieldMap::new();
        fields.insert("luminance_trigger_action".to_string(), "generate".to_string());

        store.write_fields("147788687", "9001", &fields).await.unwrap();
    }

    async fn mount_file(server: &MockServer, id: &str, status: u16, body: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/files/v3/files/{}", id)))
            .and(bearer_token("crm-token"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_attachments_from_engagements() {
        let (server, store) = setup().await;

        Mock::given(method("POST"))
            .and(path("/crm/v3/objects/engagements/search"))
            .and(bearer_token("crm-token"))
            .and(body_partial_json(json!({
                "filterGroups": [{"filters": [{
                    "propertyName": "associations.deal",
                    "operator": "EQ",
                    "value": "9001"
                }]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 3,
                "results": [
                    {"id": "e1", "properties": {"hs_attachment_ids": "101;102"}},
                    {"id": "e2", "properties": {"hs_attachment_ids": " 102 ; "}},
                    {"id": "e3", "properties": {"hs_attachment_ids": null}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v4/objects/deals/9001/associations/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .expect(0)
            .mount(&server)
            .await;
        mount_file(
            &server,
            "101",
            200,
            json!({"id": "101", "name": "msa", "extension": "pdf", "size": 2048}),
        )
        .await;
        mount_file(&server, "102", 403, json!({"category": "MISSING_SCOPES"})).await;

        let attachments = store.list_attachments("147788687", "9001").await.unwrap();

        assert_eq!(
            attachments,
            vec![
                Attachment {
                    id: "101".to_string(),
                    name: "msa".to_string(),
                    extension: "pdf".to_string(),
                    size: Some(2048),
                },
                Attachment::unnamed("102"),
            ]
        );
    }

    #[tokio::test]
    async fn test_attachments_fall_back_to_file_associations() {
        let (server, store) = setup().await;

        Mock::given(method("POST"))
            .and(path("/crm/v3/objects/engagements/search"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v4/objects/deals/9001/associations/files"))
            .and(bearer_token("crm-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"toObjectId": 201, "associationTypes": []}]
            })))
            .mount(&server)
            .await;
        mount_file(&server, "201", 200, json!({"id": "201"})).await;

        let attachments = store.list_attachments("147788687", "9001").await.unwrap();

        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].id, "201");
        assert_eq!(attachments[0].name, "File 201");
    }

    #[tokio::test]
    async fn test_attachments_fall_back_to_record_property() {
        let (server, store) = setup().await;

        Mock::given(method("POST"))
            .and(path("/crm/v3/objects/engagements/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v4/objects/deals/9001/associations/files"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/deals/9001"))
            .and(query_param("properties", "hs_attachment_ids"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "properties": {"hs_attachment_ids": "301;302;"}
            })))
            .mount(&server)
            .await;
        mount_file(&server, "301", 200, json!({"name": "a", "extension": "docx"})).await;
        mount_file(&server, "302", 200, json!({"name": "b", "extension": "pdf"})).await;

        let attachments = store.list_attachments("147788687", "9001").await.unwrap();

        let ids: Vec<&str> = attachments.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["301", "302"]);
    }

    #[tokio::test]
    async fn test_no_attachments_anywhere_is_empty() {
        let (server, store) = setup().await;

        Mock::given(method("POST"))
            .and(path("/crm/v3/objects/engagements/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v4/objects/deals/9001/associations/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/deals/9001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"properties": {}})))
            .mount(&server)
            .await;

        assert!(store.list_attachments("147788687", "9001").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attachments_without_token_is_not_authorized() {
        let (_server, store) = setup().await;
        let err = store.list_attachments("unknown", "9001").await.unwrap_err();
        assert!(matches!(err, RelayError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_in_memory_read_filters_requested_fields() {
        let store = InMemoryRecordStore::new();
        store.set_field("t", "9001", "luminance_contract_url", "https://x");
        store.set_field("t", "9001", "luminance_contract_status", "");
        store.set_field("t", "9001", "dealname", "Acme");

        let fields = store
            .read_fields(
                "t",
                "9001",
                &names(&["luminance_contract_url", "luminance_contract_status"]),
            )
            .await
            .unwrap();

        assert_eq!(fields.len(), 1);
        assert!(store.read_fields("other", "9001", &names(&["dealname"])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_write_merges() {
        let store = InMemoryRecordStore::new();
        store.set_field("t", "1", "a", "1");

        let mut fields = FieldMap::new();
        fields.insert("b".to_string(), "2".to_string());
        store.write_fields("t", "1", &fields).await.unwrap();

        assert_eq!(store.fields("t", "1").len(), 2);
    }
}
