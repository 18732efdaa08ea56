//! Purpose: MCP protocol layer: framing, JSON-RPC codec, handshake, dispatch, stdio transport.
//! Exports: submodules; see each for its own surface.
//! Role: Everything between raw stdin bytes and the tool invocation pipeline.
pub mod codec;
pub mod dispatcher;
pub mod framer;
pub mod handshake;
pub mod stdio;
