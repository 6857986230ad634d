//! Inbound FreeSWITCH Event Socket (ESL) client for Rust
//!
//! One TCP connection to FreeSWITCH carries an interleaved stream of auth
//! challenges, command replies and events, including the results of
//! background jobs. This crate reads that stream on one task and correlates
//! each message with whoever is waiting for it:
//!
//! - command replies resolve the command that is in flight,
//! - `BACKGROUND_JOB` events resolve [`EslClient::await_job`] by job id,
//! - channel events feed filtered waits and subscriptions keyed by call id
//!   and event type,
//!
//! and builds [`EslClient::originate`] on top of the last two.
//!
//! # Architecture
//!
//! - [`MessageStream`]: ordered fan-out of every inbound message to one-shot
//!   ([`NextMessage`]) and continuous ([`MessageFeed`]) observers
//! - [`JobRegistry`]: job id to result correlation
//! - [`EventBus`]: [`EventFilter`] based waits, streams and subscriptions
//! - [`EslClient`] (Clone + Send): commands, jobs, events and originate
//!
//! # Examples
//!
//! ## Originate a call
//!
//! ```rust,no_run
//! use freeswitch_esl_inbound::{EslClient, EslError, EslEventType, EventFormat, OriginateRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let client = EslClient::connect("localhost", 8021, "ClueCon").await?;
//!     client
//!         .subscribe_events(
//!             EventFormat::Plain,
//!             &[
//!                 EslEventType::BackgroundJob,
//!                 EslEventType::ChannelAnswer,
//!                 EslEventType::ChannelHangup,
//!             ],
//!         )
//!         .await?;
//!
//!     let result = client
//!         .originate(OriginateRequest::new("user/1000").with_application("echo()"))
//!         .await?;
//!     println!("{} answered: {}", result.call_id(), result.is_success());
//!     Ok(())
//! }
//! ```
//!
//! ## Background jobs
//!
//! ```rust,no_run
//! use freeswitch_esl_inbound::{EslClient, EslError, EventFormat};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let client = EslClient::connect("localhost", 8021, "ClueCon").await?;
//!     client.subscribe_events_raw(EventFormat::Plain, "BACKGROUND_JOB").await?;
//!
//!     let a = client.issue_background_command("status").await?;
//!     let b = client.issue_background_command("show channels").await?;
//!
//!     let b = client.await_job(&b, Duration::from_secs(5)).await?;
//!     let a = client.await_job(&a, Duration::from_secs(5)).await?;
//!     println!("{}\n{}", a.text(), b.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Per-call handlers
//!
//! ```rust,no_run
//! use freeswitch_esl_inbound::{EslClient, EslEventType};
//!
//! # async fn example(client: EslClient, call_id: &str) {
//! let handle = client.on(call_id, EslEventType::ChannelHangup, |event| {
//!     println!("hangup: {:?}", event.hangup_cause());
//! });
//! // ...
//! handle.dispose();
//! # }
//! ```

#[macro_use]
mod macros;

mod auth;
pub(crate) mod buffer;
pub mod bus;
pub(crate) mod command;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub mod jobs;
pub mod originate;
pub(crate) mod protocol;
pub mod stream;

pub use auth::Credentials;
pub use bus::{EslEventStream, EventBus, EventFilter, SubscriptionHandle};
pub use command::{CommandOutcome, EslCommand, ReplyStatus};
pub use connection::{ConnectionStatus, EslClient, EslConnectOptions};
pub use constants::DEFAULT_ESL_PORT;
pub use error::{EslError, EslResult};
pub use event::{EslEventType, EventFormat, ParseEventFormatError, ParseEventTypeError};
pub use headers::{EventHeader, ParseEventHeaderError};
pub use jobs::{JobRegistry, JobWait};
pub use originate::{OriginateOutcome, OriginateRequest, OriginateResult};
pub use protocol::{ContentType, EslMessage, EslParser};
pub use stream::{DisconnectReason, MessageFeed, MessageStream, NextMessage};
