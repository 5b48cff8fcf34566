fn main() {
    // ESP-IDF environment is only needed for Xtensa targets; host builds
    // (agent with simulated radio, wifi-ctl, tests) skip it.
    if let Ok(target) = std::env::var("TARGET") {
        if target.contains("xtensa") {
            embuild::espidf::sysenv::output();
        }
    }
}
