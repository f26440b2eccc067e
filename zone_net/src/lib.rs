//! Transport layer for a zone-server core: wire framing, reliable
//! delivery, bandwidth shaping, sized transfers, lag collection, and the
//! raw UDP socket/connection-init pipeline. Game-logic-agnostic by design
//! (§1 Non-goals) — this crate knows about bytes, sequence numbers, and
//! sockets, never about players, arenas, or map data.

pub mod bandwidth;
pub mod encrypt;
pub mod error;
pub mod lag;
pub mod packet;
pub mod pool;
pub mod reliable;
pub mod sequence_list;
pub mod sized;
pub mod socket;
pub mod wrapping;

pub use bandwidth::{BandwidthLimiter, Priority, TokenBucketLimiter};
pub use encrypt::{Encryptor, NullEncryptor};
pub use error::{NetError, PacketError, ReliableError};
pub use lag::{LagStats, PingSummary};
pub use pool::{BufferPool, PooledBuffer};
pub use reliable::{ReceiveOutcome, ReliableConfig, ReliableState};
pub use sequence_list::SequenceList;
pub use sized::{SizedDataSource, SizedRecv, SizedSend};
pub use socket::{ConnectionInitHandler, InitOutcome, InitPipeline, IngressDatagram, ListenData, RawSocket};
