// ABOUTME: emits a json schema for the validated firewall command to stdout.
// ABOUTME: intended for constrained decoding of the language model that produces commands.

fn main() {
    let schema = schemars::schema_for!(fwintent_common::Command);
    let json = serde_json::to_string_pretty(&schema).expect("serialize schema");
    println!("{json}");
}
