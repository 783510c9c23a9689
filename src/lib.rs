//! Tether - realtime location-sharing and geofencing server.
//!
//! The core of the platform: ingests location streams over websockets,
//! records them durably, detects place entry/exit transitions, and fans
//! location updates, place events, messages, and emergency alerts out to
//! circle peers through a hub of bounded queues and worker pools.

pub mod auth;
pub mod circles;
pub mod circles_repo;
pub mod cleanup_worker;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod emergency;
pub mod error;
pub mod geo;
pub mod geofence_worker;
pub mod hub;
pub mod kv;
pub mod location_worker;
pub mod locations;
pub mod locations_repo;
pub mod messages;
pub mod metrics;
pub mod notification_worker;
pub mod notifications;
pub mod notifications_repo;
pub mod places;
pub mod places_repo;
pub mod protocol;
pub mod rate_limiter;
pub mod room;
pub mod users;
pub mod users_repo;
pub mod visits;
pub mod web;

pub use hub::{Hub, HubHandle};
pub use locations::LocationSample;
pub use protocol::{ErrorCode, Frame, FrameType};
