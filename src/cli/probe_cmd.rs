//! `probe`: report what this host can run.

use crate::capability::{self, CapabilityProfile};
use crate::config;

use super::{report_error, required_tools, EXIT_OK};

/// Probe the host for the configured platform.
///
/// Exits 0 when the platform is usable, 3 on environment errors.
pub fn run_probe(json: bool) -> i32 {
    let env = config::load();
    let templates = match env.commands.parse() {
        Ok(t) => t,
        Err(e) => return report_error(&e),
    };
    let tools = required_tools(env.platform, &templates);
    let tool_refs: Vec<&str> = tools.iter().map(String::as_str).collect();

    match capability::probe(env.platform, &tool_refs) {
        Ok(profile) => {
            print_profile(&profile, &tools, json);
            EXIT_OK
        }
        Err(e) => report_error(&e),
    }
}

fn print_profile(profile: &CapabilityProfile, tools: &[String], json: bool) {
    if json {
        match serde_json::to_string_pretty(profile) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
        return;
    }
    println!("platform:       {}", profile.platform);
    println!(
        "kernel:         {}.{}",
        profile.kernel_major, profile.kernel_minor
    );
    println!(
        "vsock loopback: {}",
        if profile.vsock_loopback_available {
            "available"
        } else {
            "not supported (TCP loopback used for local channels)"
        }
    );
    println!("tools:          {}", tools.join(", "));
}
