//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates static
//!   shapes (with an unknown batch axis) through the graph and rejects
//!   mismatches at build time. Also provides the topological ordering the
//!   session and the gradient pass rely on.
//!
//! ```text
//! ASG (leaf shapes only) -> Shape Inference -> ASG (every node shaped)
//! ```

pub mod shape_inference;
