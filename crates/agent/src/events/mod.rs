/// 虚拟机状态事件

pub mod listener;
pub mod reconcile;

pub use listener::{EventListener, Subscription};
pub use reconcile::{EventReconciler, StateSink};
