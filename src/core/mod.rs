// Core modules shared by every layer of the server.
pub mod error;
