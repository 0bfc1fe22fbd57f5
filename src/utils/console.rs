use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// ANSI color codes for daemon console output
pub struct Colors;

impl Colors {
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    pub const SECONDARY: &'static str = "\x1b[38;2;74;155;217m";
    pub const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    pub const WARNING: &'static str = "\x1b[38;2;255;149;0m";
    pub const RESET: &'static str = "\x1b[0m";
}

/// Unicode symbols for different message types
pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "!";
    pub const INFO: &'static str = "ℹ";
    pub const ARROW: &'static str = "→";
}

static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();
static QUIET: AtomicBool = AtomicBool::new(false);

fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| {
        env::var("WARREN_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Console logger used across the daemon. Debug output is gated on the
/// WARREN_DEBUG environment variable.
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn set_quiet(quiet: bool) {
        QUIET.store(quiet, Ordering::Relaxed);
    }

    pub fn success(message: &str) {
        if !QUIET.load(Ordering::Relaxed) {
            println!("{}{} {}{}", Colors::MAIN, Symbols::SUCCESS, message, Colors::RESET);
        }
    }

    pub fn error(message: &str) {
        eprintln!("{}{} {}{}", Colors::ERROR, Symbols::ERROR, message, Colors::RESET);
    }

    pub fn warning(message: &str) {
        if !QUIET.load(Ordering::Relaxed) {
            println!("{}{} {}{}", Colors::WARNING, Symbols::WARNING, message, Colors::RESET);
        }
    }

    pub fn info(message: &str) {
        if !QUIET.load(Ordering::Relaxed) {
            println!("{}{} {}{}", Colors::SECONDARY, Symbols::INFO, message, Colors::RESET);
        }
    }

    pub fn progress(message: &str) {
        if !QUIET.load(Ordering::Relaxed) {
            println!("{}{} {}{}", Colors::SECONDARY, Symbols::ARROW, message, Colors::RESET);
        }
    }

    pub fn debug(message: &str) {
        if debug_enabled() {
            println!("{}[debug] {}{}", Colors::DIM_GRAY, message, Colors::RESET);
        }
    }
}
