pub mod app;
pub mod chain;
pub mod client;
pub mod context;
pub mod message;
pub mod replica;
pub mod storage;

pub use crate::app::App;
pub use crate::chain::{Digest, Hcv};
pub use crate::client::{Client, Outcome};
pub use crate::context::{
    ClientIndex, Config, Context, Receivers, ReplicaIndex, SeqNum, To, ViewNum,
};
pub use crate::message::Message;
pub use crate::replica::Replica;
