use std::collections::HashSet;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cli::commands::*;
use crate::cli::output::*;
use crate::events::{Event, EventBus, Topic};
use crate::io::config_io;
use crate::io::kv::{FileStore, atomic_write};
use crate::io::watcher::StoreWatcher;
use crate::model::config::AppConfig;
use crate::model::tag::Tag;
use crate::model::task::Taggable;
use crate::store::{EntityRef, EntityStore};
use crate::tags::error::{ErrorCode, TagError};
use crate::tags::input::TagInput;
use crate::tags::manager::{DeleteOptions, TagManager, TagPatch};
use crate::tags::sync::TagSync;
use crate::tags::validator::{TagDraft, suggest_alternatives, validate_batch};

/// Data directory used when `-C` is not given
pub const DEFAULT_DATA_DIR: &str = ".taskpixel";

type CmdResult = Result<(), Box<dyn Error>>;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn dispatch(cli: Cli) -> CmdResult {
    let json = cli.json;
    let dir = data_dir(cli.data_dir.as_deref());
    let mut engine = Engine::open(&dir)?;

    match cli.command {
        Commands::Tag(cmd) => match cmd.action {
            TagAction::Create(args) => cmd_tag_create(&mut engine, args, json),
            TagAction::Update(args) => cmd_tag_update(&mut engine, args, json),
            TagAction::Delete(args) => cmd_tag_delete(&mut engine, args, json),
            TagAction::List(args) => cmd_tag_list(&mut engine, args, json),
            TagAction::Search(args) => cmd_tag_search(&mut engine, args, json),
            TagAction::Show(args) => cmd_tag_show(&mut engine, args, json),
            TagAction::Suggest(args) => cmd_tag_suggest(&mut engine, args, json),
            TagAction::Stats => cmd_tag_stats(&mut engine, json),
        },
        Commands::Task(cmd) => match cmd.action {
            TaskAction::Add(args) => cmd_task_add(&mut engine, args, json),
            TaskAction::List(args) => cmd_task_list(&mut engine, args, json),
            TaskAction::Show(args) => cmd_task_show(&mut engine, args, json),
        },
        Commands::Goal(cmd) => match cmd.action {
            GoalAction::Add(args) => cmd_goal_add(&mut engine, args, json),
        },
        Commands::Attach(args) => cmd_attach(&mut engine, args, json),
        Commands::Detach(args) => cmd_detach(&mut engine, args, json),
        Commands::Recalc => cmd_recalc(&mut engine, json),
        Commands::Check => cmd_check(&mut engine, json),
        Commands::Cleanup => cmd_cleanup(&mut engine, json),
        Commands::Import(args) => cmd_import(&mut engine, args, json),
        Commands::Export(args) => cmd_export(&mut engine, args),
        Commands::Watch(args) => cmd_watch(&mut engine, args, json),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn data_dir(arg: Option<&str>) -> PathBuf {
    PathBuf::from(arg.unwrap_or(DEFAULT_DATA_DIR))
}

/// Everything a command needs: config, the file-backed store and the tag
/// engine on top of it. Nothing is loaded until first use.
pub struct Engine {
    pub config: AppConfig,
    pub files: FileStore,
    pub manager: TagManager,
}

impl Engine {
    pub fn open(dir: &Path) -> Result<Self, Box<dyn Error>> {
        let config = config_io::read_config(dir)?;
        let files = FileStore::open(dir)
            .map_err(|e| format!("cannot open data directory '{}': {}", dir.display(), e))?;
        let store = EntityStore::new(Box::new(files.clone()), &config.store, EventBus::new());
        Ok(Engine {
            config,
            files,
            manager: TagManager::new(store),
        })
    }

    fn store(&mut self) -> Result<&mut EntityStore, TagError> {
        let store = self.manager.store_mut();
        store.ensure_loaded()?;
        Ok(store)
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Find a tag by id, or by name ignoring case and a leading `#`.
fn resolve_tag(manager: &mut TagManager, key: &str) -> Result<Tag, TagError> {
    let tags = manager.all_tags();
    if let Some(tag) = tags.iter().find(|t| t.id == key) {
        return Ok(tag.clone());
    }
    let name = key.strip_prefix('#').unwrap_or(key);
    tags.into_iter()
        .find(|t| t.name_matches(name))
        .ok_or_else(|| TagError::not_found(key))
}

fn target(args: &LinkArgs) -> EntityRef<'_> {
    match args.goal.as_deref() {
        Some(goal_id) => EntityRef::Goal {
            task_id: &args.task_id,
            goal_id,
        },
        None => EntityRef::Task(&args.task_id),
    }
}

fn describe_target(args: &LinkArgs) -> String {
    match args.goal.as_deref() {
        Some(goal_id) => format!("goal {}", goal_id),
        None => format!("task {}", args.task_id),
    }
}

// ---------------------------------------------------------------------------
// Tag commands
// ---------------------------------------------------------------------------

fn cmd_tag_create(engine: &mut Engine, args: TagCreateArgs, json: bool) -> CmdResult {
    let drafts: Vec<TagDraft> = args
        .names
        .iter()
        .map(|name| TagDraft {
            name: name.clone(),
            color: args.color.clone(),
            description: args.description.clone(),
        })
        .collect();

    let batch = validate_batch(&drafts);
    if !batch.is_valid {
        if json {
            print_json(&batch)?;
        } else {
            for item in batch.results.iter().filter(|r| !r.validation.is_valid) {
                eprintln!("{}: {}", drafts[item.index].name, item.validation.errors.join("; "));
            }
        }
        return Err(TagError::validation(batch.errors).into());
    }

    let mut created = Vec::new();
    let mut failed = 0;
    for draft in &drafts {
        match engine.manager.create_tag(draft) {
            Ok(result) => {
                if !json {
                    println!("created {} ({})", result.tag.display_text, result.tag_id);
                }
                created.push(result.tag);
            }
            Err(e) if e.code == ErrorCode::DuplicateTag => {
                failed += 1;
                let existing = e.existing_tag().map(|t| t.display_text.clone()).unwrap_or_default();
                let alternatives = suggest_alternatives(&engine.manager.all_tags(), &draft.name);
                if alternatives.is_empty() {
                    eprintln!("{} already exists", existing);
                } else {
                    eprintln!("{} already exists; try: {}", existing, alternatives.join(", "));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    if json {
        print_json(&created)?;
    }
    if failed > 0 {
        return Err(format!("{} of {} tag(s) already existed", failed, drafts.len()).into());
    }
    Ok(())
}

fn cmd_tag_update(engine: &mut Engine, args: TagUpdateArgs, json: bool) -> CmdResult {
    let tag = resolve_tag(&mut engine.manager, &args.tag)?;
    let patch = TagPatch {
        name: args.name,
        color: args.color,
        description: args.description,
    };
    let updated = engine.manager.update_tag(&tag.id, &patch)?;
    if json {
        print_json(&updated)?;
    } else {
        println!("updated {} ({})", updated.display_text, updated.id);
    }
    Ok(())
}

fn cmd_tag_delete(engine: &mut Engine, args: TagDeleteArgs, json: bool) -> CmdResult {
    let tag = resolve_tag(&mut engine.manager, &args.tag)?;
    let options = DeleteOptions { force: args.force };
    match engine.manager.delete_tag(&tag.id, options) {
        Ok(deleted) => {
            if json {
                print_json(&deleted)?;
            } else {
                println!("deleted {}", deleted.display_text);
            }
            Ok(())
        }
        Err(e) if e.code == ErrorCode::TagInUse => {
            let hint = match e.usage() {
                Some(usage) => format!(
                    "{} is used by {} task(s) and {} goal(s); pass --force to strip it",
                    tag.display_text, usage.task_count, usage.goal_count
                ),
                None => e.to_string(),
            };
            Err(hint.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_tag_list(engine: &mut Engine, args: TagListArgs, json: bool) -> CmdResult {
    let tags = match args.by {
        TagOrder::Created => engine.manager.all_tags(),
        TagOrder::Usage => engine.manager.tags_by_usage(),
        TagOrder::Name => engine.manager.tags_by_name(),
    };
    if json {
        print_json(&tags)
    } else {
        print!("{}", format_tag_table(&tags));
        Ok(())
    }
}

fn cmd_tag_search(engine: &mut Engine, args: TagSearchArgs, json: bool) -> CmdResult {
    let tags = engine.manager.search_tags(&args.query);
    if json {
        print_json(&tags)
    } else {
        if tags.is_empty() {
            println!("no tags match \"{}\"", args.query);
        }
        print!("{}", format_tag_table(&tags));
        Ok(())
    }
}

fn cmd_tag_show(engine: &mut Engine, args: TagShowArgs, json: bool) -> CmdResult {
    let tag = resolve_tag(&mut engine.manager, &args.tag)?;
    let usage = engine.manager.tag_usage_info(&tag.id);
    if json {
        print_json(&TagDetailJson {
            tag: &tag,
            usage: &usage,
        })
    } else {
        print!("{}", format_tag_detail(&tag, &usage));
        Ok(())
    }
}

/// Run the autocomplete pipeline once, as if the query had been typed and
/// the debounce had elapsed.
fn cmd_tag_suggest(engine: &mut Engine, args: TagSuggestArgs, json: bool) -> CmdResult {
    let mut input = TagInput::new(engine.config.input.clone());
    let now = Instant::now();
    input.show();
    input.handle_input(&args.query, now);
    input.poll(
        &mut engine.manager,
        now + Duration::from_millis(engine.config.input.debounce_ms),
    );
    if json {
        print_json(input.suggestions())
    } else {
        for suggestion in input.suggestions() {
            println!("{}", suggestion.label());
        }
        Ok(())
    }
}

fn cmd_tag_stats(engine: &mut Engine, json: bool) -> CmdResult {
    let stats = engine.manager.tag_stats();
    if json {
        print_json(&stats)
    } else {
        println!("{} tag(s): {} used, {} unused", stats.total, stats.used, stats.unused);
        println!("average usage: {:.2}", stats.average_usage);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task and goal commands
// ---------------------------------------------------------------------------

fn cmd_task_add(engine: &mut Engine, args: TaskAddArgs, json: bool) -> CmdResult {
    let title = args.title.trim();
    if title.is_empty() {
        return Err("task title must not be empty".into());
    }
    let mut tag_ids = args
        .tags
        .iter()
        .map(|key| resolve_tag(&mut engine.manager, key).map(|t| t.id))
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = HashSet::new();
    tag_ids.retain(|id| seen.insert(id.clone()));

    let task = engine.store()?.add_task(title)?;
    for tag_id in &tag_ids {
        engine.manager.add_tag_to_task(&task.id, tag_id)?;
    }

    if json {
        let tags = engine.manager.all_tags();
        let task = engine.store()?.task(&task.id).cloned().unwrap_or(task);
        print_json(&task_to_json(&task, &tags))
    } else {
        println!("{}", task.id);
        Ok(())
    }
}

fn cmd_task_list(engine: &mut Engine, args: TaskListArgs, json: bool) -> CmdResult {
    let filter = match args.tag.as_deref() {
        Some(key) => Some(resolve_tag(&mut engine.manager, key)?.id),
        None => None,
    };
    let tags = engine.manager.all_tags();
    let tasks: Vec<_> = engine
        .store()?
        .all_tasks()
        .iter()
        .filter(|t| filter.as_deref().is_none_or(|id| t.has_tag(id)))
        .cloned()
        .collect();

    if json {
        let out: Vec<TaskJson> = tasks.iter().map(|t| task_to_json(t, &tags)).collect();
        print_json(&out)
    } else {
        for task in &tasks {
            println!("{}", format_task_line(task, &tags));
        }
        Ok(())
    }
}

fn cmd_task_show(engine: &mut Engine, args: TaskShowArgs, json: bool) -> CmdResult {
    // resolving strips dangling ids before display
    engine.manager.resolve_task_tags(&args.id)?;
    let goal_ids: Vec<String> = engine
        .store()?
        .task(&args.id)
        .map(|t| t.goals.iter().map(|g| g.id.clone()).collect())
        .unwrap_or_default();
    for goal_id in &goal_ids {
        engine.manager.resolve_goal_tags(&args.id, goal_id)?;
    }

    let tags = engine.manager.all_tags();
    let task = engine
        .store()?
        .task(&args.id)
        .cloned()
        .ok_or_else(|| format!("task not found: {}", args.id))?;

    if json {
        print_json(&task_to_json(&task, &tags))
    } else {
        println!("{}", format_task_line(&task, &tags));
        for goal in &task.goals {
            let tag_list = format_tag_list(&goal.tags, &tags);
            if tag_list.is_empty() {
                println!("  {}  {}", goal.id, goal.title);
            } else {
                println!("  {}  {}  {}", goal.id, goal.title, tag_list);
            }
        }
        Ok(())
    }
}

fn cmd_goal_add(engine: &mut Engine, args: GoalAddArgs, json: bool) -> CmdResult {
    let title = args.title.trim();
    if title.is_empty() {
        return Err("goal title must not be empty".into());
    }
    let goal = engine.store()?.add_goal(&args.task_id, title)?;
    if json {
        let tags = engine.manager.all_tags();
        print_json(&goal_to_json(&goal, &tags))
    } else {
        println!("{}", goal.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

fn cmd_attach(engine: &mut Engine, args: LinkArgs, json: bool) -> CmdResult {
    let tag_ids = args
        .tags
        .iter()
        .map(|key| resolve_tag(&mut engine.manager, key).map(|t| t.id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut current = attached_tags(engine, &args)?;
    for (key, tag_id) in args.tags.iter().zip(&tag_ids) {
        if current.as_ref().is_some_and(|ids| ids.contains(tag_id)) {
            eprintln!("{} is already attached to {}", key, describe_target(&args));
            continue;
        }
        current = Some(engine.manager.add_tag(target(&args), tag_id)?.tags);
    }
    print_link_result(engine, &args, &current.unwrap_or_default(), json)
}

fn cmd_detach(engine: &mut Engine, args: LinkArgs, json: bool) -> CmdResult {
    let mut current = attached_tags(engine, &args)?;
    for key in &args.tags {
        // dangling ids have no tag record, so fall back to the raw key
        let tag_id = match resolve_tag(&mut engine.manager, key) {
            Ok(tag) => tag.id,
            Err(_) => key.clone(),
        };
        if current.as_ref().is_some_and(|ids| !ids.contains(&tag_id)) {
            eprintln!("{} is not attached to {}", key, describe_target(&args));
            continue;
        }
        current = Some(engine.manager.remove_tag(target(&args), &tag_id)?.tags);
    }
    print_link_result(engine, &args, &current.unwrap_or_default(), json)
}

/// Tag ids on the link target, or `None` when it does not exist.
fn attached_tags(engine: &mut Engine, args: &LinkArgs) -> Result<Option<Vec<String>>, TagError> {
    let store = engine.store()?;
    Ok(store
        .task(&args.task_id)
        .and_then(|task| match args.goal.as_deref() {
            Some(goal_id) => task.goal(goal_id).map(|g| g.tags.clone()),
            None => Some(task.tags.clone()),
        }))
}

fn print_link_result(engine: &mut Engine, args: &LinkArgs, ids: &[String], json: bool) -> CmdResult {
    let tags = engine.manager.all_tags();
    if json {
        #[derive(Serialize)]
        struct LinkJson<'a> {
            task_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            goal_id: Option<&'a str>,
            tags: Vec<TagRefJson>,
        }
        print_json(&LinkJson {
            task_id: &args.task_id,
            goal_id: args.goal.as_deref(),
            tags: ids
                .iter()
                .map(|id| TagRefJson {
                    id: id.clone(),
                    name: tags.iter().find(|t| &t.id == id).map(|t| t.name.clone()),
                })
                .collect(),
        })
    } else {
        println!("{}: {}", describe_target(args), format_tag_list(ids, &tags));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

fn cmd_recalc(engine: &mut Engine, json: bool) -> CmdResult {
    let recount = engine.manager.recalculate_usage_counts()?;
    if json {
        print_json(&recount)
    } else {
        println!("{} tag(s) updated", recount.updated_count);
        Ok(())
    }
}

fn cmd_check(engine: &mut Engine, json: bool) -> CmdResult {
    let report = engine.manager.validate_data_integrity()?;
    if json {
        print_json(&report)
    } else {
        print!("{}", format_integrity_report(&report));
        Ok(())
    }
}

fn cmd_cleanup(engine: &mut Engine, json: bool) -> CmdResult {
    let report = engine.manager.cleanup_orphaned_tags()?;
    if json {
        print_json(&report)
    } else {
        println!("removed {} orphaned reference(s)", report.removed_references);
        println!("corrected {} usage count(s)", report.usage_corrected);
        if report.unused_tags > 0 {
            println!("{} tag(s) are unused", report.unused_tags);
        }
        Ok(())
    }
}

fn cmd_import(engine: &mut Engine, args: ImportArgs, json: bool) -> CmdResult {
    let content = std::fs::read_to_string(&args.file)
        .map_err(|e| format!("could not read {}: {}", args.file, e))?;
    let store = engine.manager.store_mut();
    store.import_data(&content)?;
    let (tasks, tags) = (store.all_tasks().len(), store.tags().len());
    let report = engine.manager.validate_data_integrity()?;

    if json {
        #[derive(Serialize)]
        struct ImportJson {
            tasks: usize,
            tags: usize,
            integrity: crate::tags::integrity::IntegrityReport,
        }
        print_json(&ImportJson {
            tasks,
            tags,
            integrity: report,
        })
    } else {
        println!("imported {} task(s), {} tag(s)", tasks, tags);
        if !report.is_valid {
            print!("{}", format_integrity_report(&report));
        }
        Ok(())
    }
}

fn cmd_export(engine: &mut Engine, args: ExportArgs) -> CmdResult {
    let data = engine.store()?.export_data()?;
    match args.output {
        Some(path) => {
            atomic_write(Path::new(&path), data.as_bytes())
                .map_err(|e| format!("could not write {}: {}", path, e))?;
            eprintln!("exported to {}", path);
        }
        None => println!("{}", data),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

const WATCH_POLL: Duration = Duration::from_millis(200);

fn cmd_watch(engine: &mut Engine, args: WatchArgs, json: bool) -> CmdResult {
    let bus = engine.manager.bus().clone();
    let mut sync = TagSync::new(engine.config.sync.clone(), &bus);
    let feed = bus.subscribe(&[
        Topic::TagsSynced,
        Topic::TagUsageUpdated,
        Topic::IntegrityIssues,
        Topic::ForceRefresh,
        Topic::SyncCompleted,
        Topic::SyncFailed,
    ]);

    // subscribed before the load so the first pump sees data:loaded
    engine.manager.store_mut().load()?;

    if args.once {
        sync.pump(&mut engine.manager)?;
        let outcome = sync.sync(&mut engine.manager)?;
        if json {
            return print_json(&outcome);
        }
        println!(
            "synced {} tag(s): {} usage count(s) updated",
            outcome.tags, outcome.sweep.recount.updated_count
        );
        if let Some(cleanup) = outcome.sweep.cleanup {
            println!("removed {} orphaned reference(s)", cleanup.removed_references);
        }
        return Ok(());
    }

    let watcher = StoreWatcher::start(&engine.files)?;
    eprintln!(
        "watching {} (interval {} ms, Ctrl-C to stop)",
        engine.files.dir().display(),
        engine.config.sync.interval_ms
    );

    loop {
        for change in watcher.poll() {
            if let Err(e) = sync.on_storage_changed(&mut engine.manager, &change.key) {
                tracing::error!(key = %change.key, error = %e, "reload failed");
            }
        }
        if let Err(e) = sync.pump(&mut engine.manager) {
            tracing::error!(error = %e, "event handling failed");
        }
        if let Err(e) = sync.tick(&mut engine.manager, Instant::now()) {
            tracing::error!(error = %e, "periodic sync failed");
        }
        for event in feed.drain() {
            report_event(&event, json)?;
        }
        std::thread::sleep(WATCH_POLL);
    }
}

fn report_event(event: &Event, json: bool) -> CmdResult {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        Event::TagsSynced { action, tag } => println!("{:?} {}", action, tag.display_text),
        Event::TagUsageUpdated { tag_ids, action } => {
            println!("usage {:?}: {} tag(s)", action, tag_ids.len())
        }
        Event::IntegrityIssues(report) => print!("{}", format_integrity_report(report)),
        Event::ForceRefresh => println!("reloaded after external change"),
        Event::SyncFailed { message } => println!("sync failed: {}", message),
        _ => {}
    }
    Ok(())
}
