pub mod backend;
pub mod local;

pub use backend::ReplicaFs;
pub use local::LocalFs;
