fn main() {
    // Stamp the binary with its UTC build time; logged at startup next to the
    // sidecar proxy version so stored objects can be traced to a build.
    let now = time_now_utc();
    println!("cargo:rustc-env=GCSP_BUILD_TIME={now}");
}

/// UTC timestamp from the system `date` binary, avoiding a chrono build-dependency.
fn time_now_utc() -> String {
    use std::process::Command;
    match Command::new("date")
        .args(["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .output()
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim().to_string(),
        Err(_) => "unknown".to_string(),
    }
}
