//! Protocol Module
//!
//! Layout of requests, replies and staged records, plus the frames used
//! to carry one-sided writes over TCP.
//!
//! ## Request Header (8 bytes, little-endian)
//! ```text
//! ┌──────────┬──────────────┬──────────────┐
//! │ Op (1)   │ KeyLen (3)   │ ValLen (4)   │
//! └──────────┴──────────────┴──────────────┘
//! ```
//! A request in a clerk's mailbox is `header + key`. A staged record in a
//! chunk is `header + key + value`.
//!
//! ### Operations
//! - 0: PUT    - stage a record already written into the chunk
//! - 1: GET    - look up a key
//! - 2: UPDATE - same as PUT
//! - 3: DELETE - delete from the backing store
//! - 4: CLOSE  - flush and end the connection
//! - 5: ALLOC  - flush the current chunk and get a fresh one
//!
//! ## Reply Format (little-endian)
//! ```text
//! ┌──────────────┬──────────────┬─────────────────┐
//! │ Status (4)   │ ValLen (4)   │     Value       │
//! └──────────────┴──────────────┴─────────────────┘
//! ```
//!
//! ### Status Codes
//! - 0: OK
//! - 1: NOT_FOUND
//! - 2: ERROR

mod request;
mod reply;
mod codec;
mod frame;

pub use request::{Op, Request, RequestHeader, MAX_KEY_LEN};
pub use reply::{Reply, Status};
pub use codec::{
    decode_reply, decode_request, encode_record, encode_reply, encode_request,
    REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE,
};
pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_PAYLOAD};

/// Sentinel a client stores in the clerk's flag once a request is in place
pub const CLIENT_DONE: u32 = 0x7f7f_7f7f;

/// Sentinel a clerk stores in the client's flag once a reply is in place
pub const CLERK_DONE: u32 = 0xf7f7_f7f7;
