use engine::{DcaEngine, Dispatcher};

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub dca: DcaEngine,
    pub webhook_secret: String,
}
