#[macro_use]
mod macros;

pub mod colibri2;
pub mod conference_iq;
pub mod helpers;
pub mod jingle;
pub mod jingle_dtls_srtp;
pub mod jingle_ice_udp;
pub mod jingle_rtp;
pub mod jingle_ssma;
pub mod ns;
pub mod rayo;
pub mod recorder;
