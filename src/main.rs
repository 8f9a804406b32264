//! Thin CLI shell over the library: argument parsing and dispatch only,
//! no business logic.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use git_treeclient::{ArgToken, ExecResult, GitClient, GitClientConfig, MergeMode, MergeOptions, TreeNode};

#[derive(Parser)]
#[command(name = "gitkit", about = "Drive the git object store from the command line")]
struct Cli {
    #[arg(long, global = true)]
    git_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    work_tree: Option<PathBuf>,
    #[arg(long, global = true, default_value = "git")]
    git_binary: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an arbitrary git subcommand and print captured stdout.
    Exec {
        subcommand: String,
        args: Vec<String>,
    },
    /// Read a tree-ish flat, rebuild it as a TreeNode hierarchy, and write
    /// it back through the batched `mktree` worker. Prints the resulting
    /// hash (should match the input when nothing changed).
    TreeWrite { treeish: String },
    /// Merge `input` onto `target` under a glob filter and print the
    /// resulting hash.
    TreeMerge {
        target: String,
        input: String,
        #[arg(long)]
        files: Vec<String>,
        #[arg(long, value_enum, default_value = "overlay")]
        mode: MergeModeArg,
    },
    /// Print the detected git version.
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum MergeModeArg {
    Overlay,
    Replace,
}

impl From<MergeModeArg> for MergeMode {
    fn from(value: MergeModeArg) -> Self {
        match value {
            MergeModeArg::Overlay => MergeMode::Overlay,
            MergeModeArg::Replace => MergeMode::Replace,
        }
    }
}

fn install_logger() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .expect("valid log spec")
        .start()
        .expect("failed to start logger");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_logger();
    let cli = Cli::parse();

    let config = GitClientConfig {
        git_binary: cli.git_binary,
        git_dir: cli.git_dir,
        work_tree: cli.work_tree,
        ..GitClientConfig::default()
    };
    let client = Arc::new(GitClient::new(config));

    match cli.command {
        Command::Exec { subcommand, args } => {
            let tokens = args.into_iter().map(ArgToken::Positional).collect();
            match client.exec(&subcommand, tokens).await? {
                ExecResult::Captured(Some(text)) => println!("{text}"),
                ExecResult::Captured(None) | ExecResult::Spawned(_) | ExecResult::Waited => {}
            }
        }
        Command::TreeWrite { treeish } => {
            let tree_hash = client.get_tree_hash(&treeish).await?;
            let flat = git_treeclient::snapshot::read(&client, &tree_hash).await?;
            let root = git_treeclient::snapshot::build(&client, &flat).await;
            println!("{}", root.write().await?);
        }
        Command::TreeMerge { target, input, files, mode } => {
            let target_hash = client.get_tree_hash(&target).await?;
            let input_hash = client.get_tree_hash(&input).await?;
            let target_node = TreeNode::new(client.clone(), Some(target_hash));
            let input_node = TreeNode::new(client.clone(), Some(input_hash));
            let options = MergeOptions::new(&files, mode.into())?;
            git_treeclient::merge_trees(&target_node, &input_node, options, None).await?;
            println!("{}", target_node.write().await?);
        }
        Command::Version => {
            println!("{}", client.version().await?);
        }
    }

    client.cleanup().await;
    Ok(())
}
