//! Macros for printing status messages to the console.
use owo_colors::{Color, OwoColorize};

macro_rules! ok {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<owo_colors::colors::Green>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        $crate::macros::print::<owo_colors::colors::Green>($title, format!($msg, $($arg)*).as_str());
    };
}

macro_rules! info {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<owo_colors::colors::Cyan>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        $crate::macros::print::<owo_colors::colors::Cyan>($title, format!($msg, $($arg)*).as_str());
    };
}

macro_rules! error {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<owo_colors::colors::Red>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        $crate::macros::print::<owo_colors::colors::Red>($title, format!($msg, $($arg)*).as_str());
    };
}

pub(crate) fn print<C: Color>(title: &str, msg: &str) {
    println!("{:>12} {}", title.fg::<C>().bold(), msg);
}
