//! Wire protocol between an attacher and a master process.
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix, suitable for any reliable byte stream (a Unix
//! domain socket in practice, but the codec has no transport dependency).

mod codec;
mod message;

pub use codec::{recv, send};
pub use message::{
    AttachAck, AttachHello, ClientFrame, ErrorCode, ErrorInfo, MasterFrame, RedrawMethod,
    PROTOCOL_VERSION,
};
