use std::env;
use std::process::Command;

fn main() {
    for var in ["RUSTC", "TARGET", "PROFILE"] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    emit("PLUME_BUILD_TARGET", env::var("TARGET").ok());
    emit("PLUME_BUILD_PROFILE", env::var("PROFILE").ok());
    emit("PLUME_BUILD_RUSTC_VERSION", rustc_version());
}

fn emit(key: &str, value: Option<String>) {
    let value = value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env={key}={value}");
}

fn rustc_version() -> Option<String> {
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let out = Command::new(rustc).arg("--version").output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
}
