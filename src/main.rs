fn main() {
    if let Err(err) = ibp::run() {
        eprintln!("error: {}", err);
        std::process::exit(err.exit_code());
    }
}
