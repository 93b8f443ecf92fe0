pub mod dispatcher;

pub use dispatcher::{run, DispatchReport, Dispatcher};
