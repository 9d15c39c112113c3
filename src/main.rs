#[macro_export]
macro_rules! logging {
    ($prefix:expr, $($arg:tt)*) => {
        std::println!(
            "[{}]: {}",
            $prefix,
            std::format_args!($($arg)*)
        )
    };
}

#[macro_use]
extern crate rocket;
use lazy_static::lazy_static;

use std::{env, process};

pub mod config;
pub mod core;
pub mod paqet;
pub mod server;
pub mod store;

lazy_static! {
    static ref LOGGING_FILE: std::path::PathBuf = std::path::Path::join(
        &env::temp_dir(),
        format!("paqetui-logging-{}.log", process::id()),
    );
}

fn data_dir() -> std::path::PathBuf {
    return dirs::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join(".paqetui");
}

#[rocket::main]
async fn main() {
    logging!(
        "UI",
        "Logs will be saved to {}. There will be not information on the console.",
        (*LOGGING_FILE).to_str().unwrap()
    );

    let logging_file = std::fs::File::create((*LOGGING_FILE).clone()).unwrap();
    if cfg!(not(debug_assertions)) {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::dup2(logging_file.as_raw_fd(), libc::STDOUT_FILENO);
                libc::dup2(logging_file.as_raw_fd(), libc::STDERR_FILENO);
            }
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawHandle;
            unsafe {
                let _ = winapi::um::processenv::SetStdHandle(
                    winapi::um::winbase::STD_OUTPUT_HANDLE,
                    logging_file.as_raw_handle() as _,
                );
                let _ = winapi::um::processenv::SetStdHandle(
                    winapi::um::winbase::STD_ERROR_HANDLE,
                    logging_file.as_raw_handle() as _,
                );
            }
        }
    }

    server::server_main(data_dir()).await;
}
