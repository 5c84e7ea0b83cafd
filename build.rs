fn main() {
    // macOS only lets a bare executable use CoreBluetooth when it carries an
    // Info.plist with NSBluetoothAlwaysUsageDescription.  Link it into the
    // __TEXT,__info_plist section; without it scanning never leaves the
    // "unauthorised" state.  CARGO_CFG_TARGET_OS is the target, not the host.
    println!("cargo:rerun-if-changed=Info.plist");
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
        return;
    };
    for arg in ["-sectcreate", "__TEXT", "__info_plist", &format!("{dir}/Info.plist")] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
}
