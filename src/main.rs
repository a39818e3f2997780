fn main() -> std::process::ExitCode {
    can2mqtt_lib::run()
}
