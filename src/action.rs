use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RelayError, Result};
use crate::record_store::FieldMap;

/// What the user asked the workflow to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Generate,
    Upload,
}

impl ActionKind {
    /// Action name understood by the workflow trigger.
    pub fn workflow_action(&self) -> &'static str {
        match self {
            Self::Generate => "generate_contract",
            Self::Upload => "upload_contract",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Upload => "upload",
        }
    }
}

/// Action form as submitted by the UI, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAction {
    /// Portal / account the record belongs to
    #[serde(default, alias = "portalId")]
    pub tenant_id: Option<String>,

    /// CRM record (deal) the action applies to
    #[serde(default, alias = "dealId")]
    pub target_id: Option<String>,

    #[serde(default)]
    pub action: Option<ActionKind>,

    #[serde(default)]
    pub contract_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Required for uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

impl ContractAction {
    pub fn new(
        tenant_id: impl Into<String>,
        target_id: impl Into<String>,
        action: ActionKind,
        contract_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            target_id: Some(target_id.into()),
            action: Some(action),
            contract_type: Some(contract_type.into()),
            notes: None,
            attachment_id: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_attachment(mut self, attachment_id: impl Into<String>) -> Self {
        self.attachment_id = Some(attachment_id.into());
        self
    }

    /// Check presence of every field the trigger contract needs.
    ///
    /// Reports all missing fields at once; blank strings count as missing.
    pub fn validate(&self) -> Result<ValidatedAction> {
        let mut missing = Vec::new();

        let tenant_id = present(&self.tenant_id);
        let target_id = present(&self.target_id);
        let contract_type = present(&self.contract_type);
        let attachment_id = present(&self.attachment_id);

        if tenant_id.is_none() {
            missing.push("tenantId");
        }
        if target_id.is_none() {
            missing.push("targetId");
        }
        if self.action.is_none() {
            missing.push("action");
        }
        if contract_type.is_none() {
            missing.push("contractType");
        }
        if self.action == Some(ActionKind::Upload) && attachment_id.is_none() {
            missing.push("attachmentId");
        }

        match (tenant_id, target_id, self.action, contract_type) {
            (Some(tenant_id), Some(target_id), Some(action), Some(contract_type))
                if missing.is_empty() =>
            {
                Ok(ValidatedAction {
                    tenant_id,
                    target_id,
                    action,
                    contract_type,
                    notes: present(&self.notes),
                    attachment_id,
                })
            }
            _ => Err(RelayError::ValidationError {
                missing: missing.into_iter().map(str::to_string).collect(),
            }),
        }
    }
}

fn present(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// An action with every required field present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAction {
    pub tenant_id: String,
    pub target_id: String,
    pub action: ActionKind,
    pub contract_type: String,
    pub notes: Option<String>,
    pub attachment_id: Option<String>,
}

impl ValidatedAction {
    /// JSON body for the workflow trigger webhook.
    pub fn trigger_body(&self, origin: &str, now_ms: u64) -> Value {
        json!({
            "luminanceAction__c": self.action.workflow_action(),
            "contract_type": self.contract_type,
            "hs_op_id": self.target_id,
            "upload": self.notes.clone().unwrap_or_default(),
            "signature": format!("{}-{}-{}", origin.replace(' ', "-"), self.target_id, now_ms),
            "request_origin": origin,
            "action": self.action.as_str(),
            "attachmentId": self.attachment_id.clone().unwrap_or_default(),
            "portalId": self.tenant_id,
            "credentialsResolvedServerSide": true,
        })
    }

    /// Fields written back to the record once the trigger is accepted.
    pub fn trigger_stamp(&self, now_ms: u64) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(
            "luminance_trigger_action".to_string(),
            self.action.as_str().to_string(),
        );
        fields.insert(
            "luminance_contract_type".to_string(),
            self.contract_type.clone(),
        );
        fields.insert(
            "luminance_trigger_timestamp".to_string(),
            now_ms.to_string(),
        );
        if let Some(notes) = &self.notes {
            fields.insert("luminance_notes".to_string(), notes.clone());
        }
        if let Some(attachment_id) = &self.attachment_id {
            fields.insert("luminance_attachment_id".to_string(), attachment_id.clone());
        }
        fields
    }
}

/// Accepted trigger call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerReceipt {
    pub tenant_id: String,
    pub target_id: String,
    pub action: ActionKind,

    /// Upstream response body; informational only
    pub response: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_complete_generate_action() {
        let action = ContractAction::new("147788687", "9001", ActionKind::Generate, "NDA")
            .with_notes("rush please");

        let validated = action.validate().unwrap();

        assert_eq!(validated.tenant_id, "147788687");
        assert_eq!(validated.target_id, "9001");
        assert_eq!(validated.notes.as_deref(), Some("rush please"));
        assert!(validated.attachment_id.is_none());
    }

    #[test]
    fn test_validate_lists_every_missing_field() {
        let action = ContractAction {
            tenant_id: Some("   ".to_string()),
            ..Default::default()
        };

        match action.validate().unwrap_err() {
            RelayError::ValidationError { missing } => {
                assert_eq!(missing, vec!["tenantId", "targetId", "action", "contractType"]);
            }
            other => panic!("Expected ValidationError, got {:?}", other),
        }
    }

    #[test]
    fn test_upload_requires_attachment() {
        let action = ContractAction::new("1", "2", ActionKind::Upload, "DPA");

        match action.validate().unwrap_err() {
            RelayError::ValidationError { missing } => assert_eq!(missing, vec!["attachmentId"]),
            other => panic!("Expected ValidationError, got {:?}", other),
        }

        assert!(action.with_attachment("att-7").validate().is_ok());
    }

    #[test]
    fn test_deserialize_accepts_crm_field_names() {
        let action: ContractAction = serde_json::from_value(json!({
            "portalId": "147788687",
            "dealId": "9001",
            "action": "generate",
            "contractType": "NDA"
        }))
        .unwrap();

        let validated = action.validate().unwrap();
        assert_eq!(validated.tenant_id, "147788687");
        assert_eq!(validated.target_id, "9001");
        assert_eq!(validated.action, ActionKind::Generate);
    }

    #[test]
    fn test_trigger_body_shape() {
        let validated = ContractAction::new("147788687", "9001", ActionKind::Upload, "DPA")
            .with_attachment("att-7")
            .validate()
            .unwrap();

        let body = validated.trigger_body("HubSpot Middleware", 1_700_000_000_000);

        assert_eq!(body["luminanceAction__c"], "upload_contract");
        assert_eq!(body["contract_type"], "DPA");
        assert_eq!(body["hs_op_id"], "9001");
        assert_eq!(body["upload"], "");
        assert_eq!(body["signature"], "HubSpot-Middleware-9001-1700000000000");
        assert_eq!(body["request_origin"], "HubSpot Middleware");
        assert_eq!(body["action"], "upload");
        assert_eq!(body["attachmentId"], "att-7");
        assert_eq!(body["portalId"], "147788687");
        assert_eq!(body["credentialsResolvedServerSide"], true);
    }

    #[test]
    fn test_trigger_stamp_includes_optional_fields_when_present() {
        let plain = ContractAction::new("1", "2", ActionKind::Generate, "NDA")
            .validate()
            .unwrap()
            .trigger_stamp(42);
        assert_eq!(plain.len(), 3);
        assert_eq!(plain["luminance_trigger_timestamp"], "42");

        let full = ContractAction::new("1", "2", ActionKind::Upload, "NDA")
            .with_notes("n")
            .with_attachment("a")
            .validate()
            .unwrap()
            .trigger_stamp(42);
        assert_eq!(full.len(), 5);
        assert_eq!(full["luminance_attachment_id"], "a");
    }

    #[test]
    fn test_receipt_serialization() {
        let receipt = TriggerReceipt {
            tenant_id: "1".to_string(),
            target_id: "2".to_string(),
            action: ActionKind::Generate,
            response: json!({"executionId": "abc"}),
        };
        let serialized = serde_json::to_string(&receipt).unwrap();
        assert!(serialized.contains("\"action\":\"generate\""));
    }
}
