use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tp", about = concat!("taskpixel v", env!("CARGO_PKG_VERSION"), " - tasks, goals and the tags between them"), version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Data directory (default: .taskpixel)
    #[arg(short = 'C', long = "data-dir", global = true)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, edit and query tags
    Tag(TagCmd),
    /// Add and inspect tasks
    Task(TaskCmd),
    /// Add goals to a task
    Goal(GoalCmd),
    /// Attach tags to a task or goal
    Attach(LinkArgs),
    /// Detach tags from a task or goal
    Detach(LinkArgs),
    /// Recount tag usage from scratch
    Recalc,
    /// Validate data integrity, repairing what can be derived
    Check,
    /// Remove dangling tag references and fix usage counts
    Cleanup,
    /// Replace all data with an exported JSON document
    Import(ImportArgs),
    /// Print all data as JSON
    Export(ExportArgs),
    /// Keep tags in sync while other processes edit the data
    Watch(WatchArgs),
}

// ---------------------------------------------------------------------------
// Tag subcommands
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct TagCmd {
    #[command(subcommand)]
    pub action: TagAction,
}

#[derive(Subcommand)]
pub enum TagAction {
    /// Create one or more tags
    Create(TagCreateArgs),
    /// Change a tag's name, color or description
    Update(TagUpdateArgs),
    /// Delete a tag
    Delete(TagDeleteArgs),
    /// List all tags
    List(TagListArgs),
    /// Search tags by name or description
    Search(TagSearchArgs),
    /// Show a tag and everything that uses it
    Show(TagShowArgs),
    /// Autocomplete suggestions for partial input
    Suggest(TagSuggestArgs),
    /// Tag usage statistics
    Stats,
}

#[derive(Args)]
pub struct TagCreateArgs {
    /// Tag names (a leading # is stripped)
    #[arg(required = true)]
    pub names: Vec<String>,
    /// Color as #RRGGBB (default: picked from the palette)
    #[arg(long)]
    pub color: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Args)]
pub struct TagUpdateArgs {
    /// Tag id or name
    pub tag: String,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub color: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Args)]
pub struct TagDeleteArgs {
    /// Tag id or name
    pub tag: String,
    /// Strip the tag from every task and goal that uses it
    #[arg(long)]
    pub force: bool,
}

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum TagOrder {
    /// Storage order
    #[default]
    Created,
    /// Most used first
    Usage,
    /// Alphabetical, ignoring case
    Name,
}

#[derive(Args)]
pub struct TagListArgs {
    #[arg(long, value_enum, default_value_t)]
    pub by: TagOrder,
}

#[derive(Args)]
pub struct TagSearchArgs {
    pub query: String,
}

#[derive(Args)]
pub struct TagShowArgs {
    /// Tag id or name
    pub tag: String,
}

#[derive(Args)]
pub struct TagSuggestArgs {
    /// Partial input, as typed into a tag box
    pub query: String,
}

// ---------------------------------------------------------------------------
// Task / goal subcommands
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct TaskCmd {
    #[command(subcommand)]
    pub action: TaskAction,
}

#[derive(Subcommand)]
pub enum TaskAction {
    /// Add a task
    Add(TaskAddArgs),
    /// List tasks with their tags
    List(TaskListArgs),
    /// Show a task, its goals and resolved tags
    Show(TaskShowArgs),
}

#[derive(Args)]
pub struct TaskAddArgs {
    pub title: String,
    /// Tags to attach (id or name)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Args)]
pub struct TaskListArgs {
    /// Only tasks carrying this tag (id or name)
    #[arg(long)]
    pub tag: Option<String>,
}

#[derive(Args)]
pub struct TaskShowArgs {
    pub id: String,
}

#[derive(Args)]
pub struct GoalCmd {
    #[command(subcommand)]
    pub action: GoalAction,
}

#[derive(Subcommand)]
pub enum GoalAction {
    /// Add a goal to a task
    Add(GoalAddArgs),
}

#[derive(Args)]
pub struct GoalAddArgs {
    pub task_id: String,
    pub title: String,
}

// ---------------------------------------------------------------------------
// Linking and maintenance
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct LinkArgs {
    pub task_id: String,
    /// Tags (id or name)
    #[arg(required = true)]
    pub tags: Vec<String>,
    /// Target a goal of the task instead of the task itself
    #[arg(long)]
    pub goal: Option<String>,
}

#[derive(Args)]
pub struct ImportArgs {
    /// JSON file to import
    pub file: String,
}

#[derive(Args)]
pub struct ExportArgs {
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<String>,
}

#[derive(Args)]
pub struct WatchArgs {
    /// Run a single sync pass and exit
    #[arg(long)]
    pub once: bool,
}
