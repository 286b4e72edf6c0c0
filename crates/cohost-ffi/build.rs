fn main() {
    uniffi::generate_scaffolding("src/cohost.udl").unwrap();
}
