fn main() -> std::process::ExitCode {
  mpvrc_lib::run()
}
