pub mod alignment;
pub mod interpolation;
pub mod transform;
pub mod window;
pub mod window_store;

pub use alignment::TimeAlignmentStage;
pub use interpolation::{InterpolationMethod, InterpolationStage};
pub use transform::{TransformFn, TransformationStage};
pub use window::{WindowOperation, WindowStage};
pub use window_store::WindowStore;
