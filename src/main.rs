fn main() {
    if let Err(err) = toolbridge::cli::main() {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
