// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// VPN Engine - Common Library
// Data model, requests, settings and the control API client

pub mod client;
pub mod config;
pub mod error;
pub mod location;
pub mod settings;
pub mod sse;
pub mod types;

pub use client::{
    cleanup, connect, connect_with_events, create_daemon_client, create_event_client,
    disconnect, fetch_status, ConnectionMode as ClientConnectionMode, DaemonClientConfig,
    EngineEventHandler,
};
pub use config::{
    ConnectRequest, ConnectionMode, Credentials, FirewallRequest, ProxySettings, WireGuardKeys,
};
pub use error::{Error, Result};
pub use location::{LocationInfo, Node, StaticIpInfo};
pub use settings::{SettingsStore, SUCCESS_CONNECTION_PROTOCOL};
pub use sse::EventListener;
pub use types::{
    AdapterInfo, AttemptInfo, ConnectError, ConnectionDescriptor, ConnectionNodeType,
    EngineEvent, EngineStatus, PortMap, PortMapEntry, Protocol, TunnelState,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
