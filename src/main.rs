fn main() {
    if let Err(e) = brazier::cli::main() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
