use tokio::task::JoinError;

pub fn try_extract_panic_message(err: JoinError) -> String {
    if err.is_panic() {
        let panic = err.into_panic();
        if let Some(panic_message) = panic.downcast_ref::<String>() {
            panic_message.to_string()
        } else if let Some(panic_message) = panic.downcast_ref::<&str>() {
            panic_message.to_string()
        } else {
            "Unknown panic".to_string()
        }
    } else {
        "Cancelled task".to_string()
    }
}
