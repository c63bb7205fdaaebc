use db::models::{
    agent::{Agent, CreateAgent},
    agent_memory::MemoryStep,
    project::{CreateProject, Project},
    task::{CreateTask, Task, TaskStatus, TaskWithAssignees, UpdateTask},
};
use services::services::{
    broadcast::{AgentLog, LogLevel, TaskStatusUpdate},
    execution::{ExecutionPhase, ExecutionSummary},
    gatekeeper::RunAccepted,
};
use ts_rs::TS;

fn generate_types_content() -> String {
    let header = "// This file was generated by `cargo run --bin generate_types`. Do not edit it manually.\n";
    let decls = [
        Project::decl(),
        CreateProject::decl(),
        Agent::decl(),
        CreateAgent::decl(),
        TaskStatus::decl(),
        Task::decl(),
        TaskWithAssignees::decl(),
        CreateTask::decl(),
        UpdateTask::decl(),
        MemoryStep::decl(),
        server::routes::tasks::SetAssignees::decl(),
        RunAccepted::decl(),
        ExecutionPhase::decl(),
        ExecutionSummary::decl(),
        TaskStatusUpdate::decl(),
        LogLevel::decl(),
        AgentLog::decl(),
    ];
    let body = decls
        .into_iter()
        .map(|decl| format!("export {decl}"))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{header}\n{body}\n")
}

fn main() {
    let check_mode = std::env::args().any(|arg| arg == "--check");
    let content = generate_types_content();

    let Some(path) = std::env::args().skip(1).find(|arg| !arg.starts_with("--")) else {
        print!("{content}");
        return;
    };

    if check_mode {
        match std::fs::read_to_string(&path) {
            Ok(current) if current == content => println!("Shared types are up to date."),
            _ => {
                eprintln!("Shared types in {path} are out of date. Run generate_types to update.");
                std::process::exit(1);
            }
        }
    } else if let Err(e) = std::fs::write(&path, content) {
        eprintln!("Failed to write {path}: {e}");
        std::process::exit(1);
    }
}
