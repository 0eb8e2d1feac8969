pub mod aoi;
pub mod connection;
pub mod dispatcher;
pub mod dos_protection;
pub mod framing;
pub mod game_session;
pub mod gm;
pub mod protocol;
pub mod session;
pub mod transport;
