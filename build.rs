use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        free_unix: { all(unix, not(any(target_os = "macos", target_os = "ios", target_os = "android"))) },
        x11_platform: { all(feature = "x11", free_unix) },
        wayland_platform: { all(feature = "wayland", free_unix) },
        windows_platform: { windows },
    }

    println!("cargo:rerun-if-changed=build.rs");
}
