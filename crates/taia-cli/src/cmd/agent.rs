//! Agent and skill commands: list, register, enable/disable, grant, revoke.

use super::{boot_kernel, fail, print_json, Context};
use taia_types::agent::{AgentConfig, AgentId, AgentStatus};
use taia_types::skill::SkillId;

pub fn cmd_agent_list(ctx: &Context) {
    let kernel = boot_kernel(ctx, false);
    let agents = kernel.registry.list_agents();
    if ctx.json {
        print_json(&agents);
        return;
    }
    if agents.is_empty() {
        println!("No agents registered.");
        return;
    }
    println!(
        "{:<20} {:<24} {:<10} {:>6}  LAST ACTIVE",
        "ID", "NAME", "STATUS", "SKILLS"
    );
    println!("{}", "-".repeat(86));
    for a in agents {
        println!(
            "{:<20} {:<24} {:<10} {:>6}  {}",
            a.id.as_str(),
            a.name,
            a.status.to_string(),
            a.skill_count,
            a.last_active.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

pub fn cmd_agent_register(
    ctx: &Context,
    id: &str,
    name: Option<String>,
    description: Option<String>,
) {
    let kernel = boot_kernel(ctx, false);
    let config = AgentConfig {
        name: name.unwrap_or_default(),
        description: description.unwrap_or_default(),
        capabilities: Vec::new(),
    };
    match kernel.registry.register_agent(AgentId::new(id), config) {
        Ok(agent) => {
            println!("Agent registered.");
            println!("  ID:    {}", agent.id);
            println!("  Token: {}", agent.token);
            println!("\n  The token is shown once; store it with the agent.");
        }
        Err(e) => fail(format!("Failed to register agent: {e}")),
    }
}

pub fn cmd_agent_enable(ctx: &Context, id: &str, enable: bool) {
    let kernel = boot_kernel(ctx, false);
    let status = if enable {
        AgentStatus::Idle
    } else {
        AgentStatus::Disabled
    };
    match kernel.registry.set_agent_status(&AgentId::new(id), status) {
        Ok(agent) => println!("Agent {} is now {}.", agent.id, agent.status),
        Err(e) => fail(format!("Failed to update agent: {e}")),
    }
}

pub fn cmd_agent_skills(ctx: &Context, id: &str) {
    let kernel = boot_kernel(ctx, false);
    let skills = kernel
        .registry
        .get_agent_skills(&AgentId::new(id))
        .unwrap_or_else(|e| fail(format!("Failed to read skills: {e}")));
    if ctx.json {
        print_json(&skills);
        return;
    }
    if skills.is_empty() {
        println!("Agent {id} holds no skills.");
        return;
    }
    for s in skills {
        let marker = if s.is_critical() { " (critical)" } else { "" };
        println!("  {}{marker}", s.id);
    }
}

pub fn cmd_skill_list(ctx: &Context) {
    let kernel = boot_kernel(ctx, false);
    let skills = kernel.registry.list_skills();
    if ctx.json {
        print_json(&skills);
        return;
    }
    println!(
        "{:<16} {:<10} {:>4}  {:<8} {:<24} DESCRIPTION",
        "ID", "CATEGORY", "RISK", "ACTION", "PREREQUISITES"
    );
    println!("{}", "-".repeat(100));
    for s in skills {
        let prerequisites = s
            .prerequisites
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<16} {:<10} {:>4}  {:<8} {:<24} {}",
            s.id.as_str(),
            format!("{:?}", s.category),
            s.risk_level,
            s.action.to_string(),
            prerequisites,
            s.description
        );
    }
}

pub fn cmd_skill_grant(ctx: &Context, agent: &str, skill: &str, token: Option<&str>) {
    let kernel = boot_kernel(ctx, false);
    match kernel
        .registry
        .assign_skill(&AgentId::new(agent), &SkillId::new(skill), token)
    {
        Ok(result) => {
            if ctx.json {
                print_json(&result);
                return;
            }
            if result.already_granted {
                println!("{agent} already holds {skill}.");
            } else {
                println!("Granted {skill} to {agent}.");
            }
            if !result.missing_prerequisites.is_empty() {
                let missing = result
                    .missing_prerequisites
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("  Warning: missing prerequisites: {missing}");
            }
        }
        Err(e) => fail(format!("Failed to grant skill: {e}")),
    }
}

pub fn cmd_skill_revoke(ctx: &Context, agent: &str, skill: &str) {
    let kernel = boot_kernel(ctx, false);
    match kernel
        .registry
        .revoke_skill(&AgentId::new(agent), &SkillId::new(skill))
    {
        Ok(true) => println!("Revoked {skill} from {agent}."),
        Ok(false) => println!("{agent} did not hold {skill}."),
        Err(e) => fail(format!("Failed to revoke skill: {e}")),
    }
}
