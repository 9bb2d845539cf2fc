use owo_colors::OwoColorize;

pub mod redact;
pub mod shutdown;
pub mod wait;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const STABLE_ID: &str = "validation.jupyter-operator.io/stable-id";
    pub const CREATED_BY: &str = "validation.jupyter-operator.io/created-by";
    pub const SPEC_HASH: &str = "validation.jupyter-operator.io/spec-hash";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub mod response {
    use super::*;
    use std::fmt::{Debug, Display};

    pub fn print_error<T: Display + Debug>(e: T) {
        eprintln!(
            "🛑 {}",
            format!("{:?}", e)
                .split('\n')
                .map(|s| s.red().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn print_warning<T: Display + Debug>(e: T) {
        eprintln!(
            "⚠️ {}",
            format!("{:?}", e)
                .split('\n')
                .map(|s| s.yellow().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }
}
