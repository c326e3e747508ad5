//! Reference collaborators the engine drives: tensors, a linear model,
//! losses, optimizers and learning-rate schedules.

pub mod linear;
pub mod loss;
pub mod model;
pub mod optim;
pub mod schedule;
pub mod tensor;

pub use linear::LinearRegressor;
pub use loss::{Loss, MseLoss};
pub use model::{Mode, Model, Parameter, StateDict};
pub use optim::{Optimizer, Sgd};
pub use schedule::{LrPolicy, LrScheduler, Scheduler};
pub use tensor::Tensor;
