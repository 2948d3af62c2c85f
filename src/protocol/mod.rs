//! Protocol module for the bottle's link-level conversation.
//!
//! This module contains:
//! - Telemetry frame assembly and parsing
//! - The post-connect handshake sequencer

pub mod frame;
pub mod handshake;

pub use frame::{decode_frame, FrameAssembler, FRAME_DELIMITER};
pub use handshake::{
    HandshakeFailure, HandshakeParams, HandshakeRequest, HandshakeSequencer, HandshakeStep,
    Transition,
};
