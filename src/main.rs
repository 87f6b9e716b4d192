use retrace::commands;

fn main() {
    commands::dispatch();
}
