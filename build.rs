fn main() {
    // Copy WinDivert runtime files (DLL + kernel driver) next to the output binary.
    // The user-mode DLL and the signed driver must come from the same release,
    // otherwise opening a handle fails with ERROR_DRIVER_FAILED_PRIOR_UNLOAD.
    #[cfg(target_os = "windows")]
    {
        let Ok(out_dir) = std::env::var("OUT_DIR") else {
            return;
        };
        let out_dir = std::path::PathBuf::from(out_dir);
        // OUT_DIR is e.g. target/debug/build/dpiguard-xxx/out
        // Walk up to target/debug/ (or target/release/).
        let Some(target_dir) = out_dir.ancestors().nth(3) else {
            println!("cargo:warning=could not determine target dir, WinDivert files not copied");
            return;
        };

        for file in &["WinDivert.dll", "WinDivert64.sys"] {
            let src = std::path::Path::new("vendor/windivert").join(file);
            if src.exists() {
                let dst = target_dir.join(file);
                match std::fs::copy(&src, &dst) {
                    Ok(_) => println!("cargo:warning=Copied {file} to {}", dst.display()),
                    Err(e) => println!("cargo:warning=failed to copy {file}: {e}"),
                }
            }
        }

        println!("cargo:rerun-if-changed=vendor/windivert/WinDivert.dll");
        println!("cargo:rerun-if-changed=vendor/windivert/WinDivert64.sys");
    }
}
