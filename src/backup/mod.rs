pub mod atomic_json;
pub mod backup_config;
pub mod cancel;
pub mod exclude;
pub mod health;
pub mod lock;
pub mod manifest;
pub mod orchestrator;
pub mod power;
pub mod queue;
pub mod result_error;
pub mod retention;
pub mod retry;
pub mod snapshot;
pub mod space;
pub mod status;
pub mod validate;
pub mod verify;
pub mod walk;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
