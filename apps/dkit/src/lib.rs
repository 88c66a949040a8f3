// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

pub mod bridge;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod logging;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod websocket;

pub use config::Config;
pub use gateway::{GatewayEvent, PeerGateway};
pub use server::{create_app, create_app_with, default_connector};
pub use transport::{PeerConnection, TransportConnector, TransportEvent, VideoTrack};
