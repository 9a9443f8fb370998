//! # Contract Relay
//!
//! Middleware between a CRM portal (HubSpot) and an external contract
//! workflow. It keeps a valid OAuth bearer token per portal, fires the
//! workflow's trigger webhook with credentials resolved server-side, and
//! polls the CRM record until the workflow writes its result back.
//!
//! The pieces are separate seams so each can be swapped or faked:
//!
//! - [`TokenRepository`] + [`AuthorizationServer`] behind [`TokenManager`]
//!   (cache-aside refresh, single flight per tenant)
//! - [`TriggerEndpoint`] for the webhook
//! - [`RecordStore`] for reading and stamping record fields
//! - [`Scheduler`] and [`Clock`] for time
//!
//! [`WorkflowSession`] ties them together as an explicit state machine and
//! publishes a [`SessionEvent`] on every transition.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use contract_relay::{ActionKind, ContractAction, RelayConfig, Result};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<()> {
//! let config = RelayConfig::from_path("relay.toml")?.with_env_overrides()?;
//! config.validate()?;
//!
//! let tokens = Arc::new(config.token_manager()?);
//! let session = config.session(tokens);
//!
//! let action = ContractAction::new("147788687", "9001", ActionKind::Generate, "NDA");
//! session.submit(&action).await?;
//! let outcome = session.wait_terminal().await;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod oauth;
pub mod poll;
pub mod record_store;
pub mod repository;
pub mod session;
pub mod streaming;
pub mod token;
pub mod token_manager;
pub mod trigger;

pub use action::{ActionKind, ContractAction, TriggerReceipt, ValidatedAction};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigStatus, RelayConfig};
pub use error::{RelayError, Result};
pub use events::SessionEvent;
pub use logging::init_logging;
pub use oauth::{AuthorizationServer, HttpAuthorizationServer, OAuthClientConfig, TokenBroker};
pub use poll::{PollConfig, PollOutcome, Poller, Scheduler, TokioScheduler};
pub use record_store::{Attachment, CrmRecordStore, FieldMap, InMemoryRecordStore, RecordStore};
pub use repository::{FileTokenRepository, InMemoryTokenRepository, TokenRepository};
pub use session::{SessionState, WorkflowSession};
pub use streaming::{EventHub, SessionEventStream};
pub use token::{TokenGrant, TokenRecord};
pub use token_manager::TokenManager;
pub use trigger::{TriggerEndpoint, WebhookTrigger};
