pub mod requests;

pub use requests::{GenerationRequest, GenerationResponse, Provider, TaskType};
