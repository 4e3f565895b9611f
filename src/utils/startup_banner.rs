pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;31m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
           _             _           _
  _ __ ___| | __ _ _   _| |__  _   _| |__
 | '__/ _ \ |/ _` | | | | '_ \| | | | '_ \
 | | |  __/ | (_| | |_| | | | | |_| | |_) |
 |_|  \___|_|\__,_|\__, |_| |_|\__,_|_.__/
                   |___/                    "#;
    const APP_DESCRIPTION: &str =
        "Real-time gateway relaying client activity to platform workers over an encrypted job queue.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("RELAYHUB_BUILD_DATE_UTC"),
        env!("RELAYHUB_BUILD_COMMIT")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}Session secrets are generated per run and never written to disk.{RESET}");
    println!();
    println!("================================================================");
    println!();
}
