mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use ficshelf_core::archive::STORY_RECORD_FILE;
use ficshelf_core::db::{copy_catalog, export_to_json};
use ficshelf_core::import::read_imported_story;
use ficshelf_core::{
    create_backend, ArchiveLayout, CatalogBackend, CategoryDraft, CategoryId, Color, FileSettingsBackend,
    Importer, SettingsService, Story, StoryDraft, StoryId, Tag, TagCategory, TagDraft, TagId,
    TagMappingCache,
};

use crate::cli::{
    CategoryCommand, Cli, Command, ConfigCommand, MappingCommand, StoryCommand, TagCommand,
};

/// The opened archive every command works on
struct Catalog {
    layout: ArchiveLayout,
    backend: Box<dyn CatalogBackend>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let settings_backend =
        FileSettingsBackend::at_default_location().context("Failed to locate settings")?;
    let settings =
        SettingsService::new(Box::new(settings_backend)).context("Failed to load settings")?;

    if let Command::Config(config_cmd) = &cli.command {
        return handle_config_command(config_cmd, &settings);
    }

    let current = settings.get();
    let archive_dir = match &cli.archive {
        Some(dir) => dir.clone(),
        None => current.archive_dir()?,
    };
    let backend = create_backend(&archive_dir, cli.backend.or(current.backend))
        .with_context(|| format!("Failed to open archive {:?}", archive_dir))?;
    log::debug!(
        "opened {} catalog at {:?}",
        backend.backend_type(),
        backend.location()
    );
    let catalog = Catalog {
        layout: ArchiveLayout::new(&archive_dir),
        backend,
    };

    match &cli.command {
        Command::Category(category_cmd) => {
            handle_category_command(category_cmd, &catalog)?;
        }
        Command::Tag(tag_cmd) => {
            handle_tag_command(tag_cmd, &catalog)?;
        }
        Command::Story(story_cmd) => {
            handle_story_command(story_cmd, &catalog)?;
        }
        Command::Import { file, no_mappings } => {
            let mut options = current.import_options();
            if *no_mappings {
                options.update_mappings = false;
            }
            import_story(&catalog, file, options)?;
        }
        Command::Mapping(mapping_cmd) => {
            handle_mapping_command(mapping_cmd, &catalog)?;
        }
        Command::Convert { to, dest } => {
            convert_catalog(&catalog, *to, dest)?;
        }
        Command::Export { file } => {
            let summary = export_to_json(catalog.backend.as_ref(), file)
                .with_context(|| format!("Failed to export to {:?}", file))?;
            println!(
                "{} Exported {} categories, {} tags, {} stories and {} files to {}",
                "✓".green(),
                summary.categories,
                summary.tags,
                summary.stories,
                summary.files,
                file.display()
            );
        }
        Command::Stats => {
            let stats = catalog.backend.stats()?;
            println!("{}: {}", "Archive".blue(), catalog.layout.root().display());
            println!("{}: {}", "Backend".blue(), stats.backend_type);
            println!("{}: {}", "Categories".blue(), stats.category_count);
            println!("{}: {}", "Tags".blue(), stats.tag_count);
            println!("{}: {}", "Stories".blue(), stats.story_count);
        }
        Command::Config(config_cmd) => {
            handle_config_command(config_cmd, &settings)?;
        }
    }

    Ok(())
}

// ============================================================================
// Lookups
// ============================================================================

fn find_category(backend: &dyn CatalogBackend, name_or_id: &str) -> Result<TagCategory> {
    if let Some(category) = backend.get_category_by_name(name_or_id)? {
        return Ok(category);
    }
    if let Ok(id) = name_or_id.parse::<CategoryId>() {
        if let Some(category) = backend.get_category(id)? {
            return Ok(category);
        }
    }
    anyhow::bail!("Category '{}' not found", name_or_id)
}

fn find_tag(backend: &dyn CatalogBackend, name_or_id: &str) -> Result<Tag> {
    if let Some(tag) = backend.get_tag_by_name(name_or_id)? {
        return Ok(tag);
    }
    if let Ok(id) = name_or_id.parse::<TagId>() {
        if let Some(tag) = backend.get_tag(id)? {
            return Ok(tag);
        }
    }
    anyhow::bail!("Tag '{}' not found", name_or_id)
}

/// Accepts a story ID or an unambiguous title
fn find_story(backend: &dyn CatalogBackend, name_or_id: &str) -> Result<Story> {
    if let Ok(id) = name_or_id.parse::<StoryId>() {
        return backend
            .get_story(id)?
            .with_context(|| format!("Story {} not found", id));
    }

    let mut matches: Vec<Story> = backend
        .list_stories()?
        .into_iter()
        .filter(|s| s.name() == name_or_id)
        .collect();
    match matches.len() {
        0 => anyhow::bail!("Story '{}' not found", name_or_id),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!(
            "{} stories are titled '{}'; use the story ID instead",
            n,
            name_or_id
        ),
    }
}

fn parse_tag_list(backend: &dyn CatalogBackend, list: &str) -> Result<BTreeSet<TagId>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| find_tag(backend, name).map(|t| t.id()))
        .collect()
}

fn tag_names(backend: &dyn CatalogBackend, ids: &BTreeSet<TagId>) -> Result<String> {
    let mut names = Vec::with_capacity(ids.len());
    for id in ids {
        match backend.get_tag(*id)? {
            Some(tag) => names.push(tag.name().to_string()),
            None => names.push(format!("{} (deleted)", id)),
        }
    }
    Ok(names.join(", "))
}

fn story_names(backend: &dyn CatalogBackend, ids: &BTreeSet<StoryId>) -> Result<String> {
    let mut names = Vec::with_capacity(ids.len());
    for id in ids {
        match backend.get_story(*id)? {
            Some(story) => names.push(story.name().to_string()),
            None => names.push(id.to_string()),
        }
    }
    Ok(names.join(", "))
}

fn colored_name(category: &TagCategory) -> colored::ColoredString {
    let (r, g, b) = category.color().rgb();
    category.name().truecolor(r, g, b)
}

// ============================================================================
// Categories
// ============================================================================

fn handle_category_command(cmd: &CategoryCommand, catalog: &Catalog) -> Result<()> {
    let backend = catalog.backend.as_ref();

    match cmd {
        CategoryCommand::Add {
            name,
            description,
            color,
            sort_order,
        } => {
            let mut draft = CategoryDraft::new(name.clone());
            draft.description = description.clone();
            if let Some(color) = color {
                draft.color = Color::parse_hex(color)?;
            }
            if let Some(sort_order) = sort_order {
                draft.sort_order = *sort_order;
            } else {
                draft.sort_order = backend.list_categories()?.len() as i32;
            }

            let category = TagCategory::new(draft)?;
            backend.create_category(&category)?;
            println!(
                "{} Category '{}' added ({})",
                "✓".green(),
                colored_name(&category),
                category.id()
            );
        }
        CategoryCommand::List => {
            let categories = backend.list_categories()?;
            if categories.is_empty() {
                println!("{}", "No categories found.".yellow());
                return Ok(());
            }

            println!("{:<5} | {:<30} | {:<8} | {:<5}", "Order", "Name", "Color", "Tags");
            println!("{}", "-".repeat(58));
            for category in categories {
                let tag_count = backend.tags_in_category(category.id())?.len();
                println!(
                    "{:<5} | {:<30} | {:<8} | {:<5}",
                    category.sort_order(),
                    colored_name(&category),
                    category.color().to_string(),
                    tag_count
                );
            }
        }
        CategoryCommand::Delete { name, move_to } => {
            let category = find_category(backend, name)?;
            if let Some(target) = move_to {
                let target = find_category(backend, target)?;
                if target.id() == category.id() {
                    anyhow::bail!("Cannot move tags into the category being deleted");
                }
                let moved = backend.change_category(category.id(), target.id())?;
                println!(
                    "{} Moved {} tag(s) to '{}'",
                    "✓".green(),
                    moved,
                    target.name()
                );
            }
            backend
                .delete_category(category.id())
                .with_context(|| format!("Failed to delete category '{}'", category.name()))?;
            println!("{} Category '{}' deleted", "✓".green(), category.name());
        }
    }

    Ok(())
}

// ============================================================================
// Tags
// ============================================================================

fn handle_tag_command(cmd: &TagCommand, catalog: &Catalog) -> Result<()> {
    let backend = catalog.backend.as_ref();

    match cmd {
        TagCommand::Add {
            name,
            category,
            description,
            implies,
        } => {
            let category = find_category(backend, category)?;
            let mut draft = TagDraft::new(name.clone(), category.id());
            draft.description = description.clone();
            if let Some(implies) = implies {
                draft.implied_tags = parse_tag_list(backend, implies)?;
            }

            let tag = Tag::new(draft)?;
            backend.create_tag(&tag)?;
            println!(
                "{} Tag '{}' added to '{}' ({})",
                "✓".green(),
                tag.name(),
                colored_name(&category),
                tag.id()
            );
        }
        TagCommand::List { category, implied } => {
            let tags = match category {
                Some(name) => {
                    let category = find_category(backend, name)?;
                    if *implied {
                        backend.tags_in_category_including_implied(category.id())?
                    } else {
                        backend.tags_in_category(category.id())?
                    }
                }
                None => backend.list_tags()?,
            };
            if tags.is_empty() {
                println!("{}", "No tags found.".yellow());
                return Ok(());
            }

            let categories: BTreeMap<CategoryId, TagCategory> = backend
                .list_categories()?
                .into_iter()
                .map(|c| (c.id(), c))
                .collect();

            println!("{:<30} | {:<20} | {}", "Name", "Category", "Implies");
            println!("{}", "-".repeat(80));
            for tag in tags {
                let category = match categories.get(&tag.category_id()) {
                    Some(c) => colored_name(c),
                    None => "?".red(),
                };
                println!(
                    "{:<30} | {:<20} | {}",
                    tag.name(),
                    category,
                    tag_names(backend, tag.implied_tags())?
                );
            }
        }
        TagCommand::Show { name } => {
            let tag = find_tag(backend, name)?;
            let category = backend.get_category(tag.category_id())?;

            println!("{}: {}", "ID".blue(), tag.id());
            println!("{}: {}", "Name".blue(), tag.name());
            match &category {
                Some(c) => println!("{}: {}", "Category".blue(), colored_name(c)),
                None => println!("{}: {}", "Category".blue(), "(missing)".red()),
            }
            if let Some(description) = tag.description() {
                println!("{}: {}", "Description".blue(), description);
            }
            if !tag.implied_tags().is_empty() {
                println!(
                    "{}: {}",
                    "Implies".blue(),
                    tag_names(backend, tag.implied_tags())?
                );

                let mut closure = backend.resolve_implied(&BTreeSet::from([tag.id()]))?;
                closure.remove(&tag.id());
                println!("{}: {}", "Implies (all)".blue(), tag_names(backend, &closure)?);
            }

            let implying = backend.implying_tags(tag.id())?;
            if !implying.is_empty() {
                let names: Vec<&str> = implying.iter().map(|t| t.name()).collect();
                println!("{}: {}", "Implied by".blue(), names.join(", "));
            }
        }
        TagCommand::Delete { name } => {
            let tag = find_tag(backend, name)?;
            backend.delete_tag(tag.id())?;
            println!("{} Tag '{}' deleted", "✓".green(), tag.name());
        }
    }

    Ok(())
}

// ============================================================================
// Stories
// ============================================================================

fn handle_story_command(cmd: &StoryCommand, catalog: &Catalog) -> Result<()> {
    let backend = catalog.backend.as_ref();

    match cmd {
        StoryCommand::Add {
            name,
            author,
            url,
            description,
            tags,
            sequel_of,
        } => {
            let mut draft = StoryDraft::new(name.clone());
            draft.author = author.clone();
            draft.url = url.clone();
            draft.description = description.clone();
            if let Some(tags) = tags {
                draft.tags = parse_tag_list(backend, tags)?;
            }
            if let Some(prequel) = sequel_of {
                draft.prequels.insert(find_story(backend, prequel)?.id());
            }

            let story = Story::new(draft)?;
            backend.create_story(&story)?;
            println!(
                "{} Story '{}' added ({})",
                "✓".green(),
                story.name(),
                story.id()
            );
        }
        StoryCommand::List { tag } => {
            let mut stories = backend.list_stories()?;
            if let Some(tag) = tag {
                let tag = find_tag(backend, tag)?;
                // A story matches when any explicit tag of it implies the filter
                let implying = backend.tag_graph()?.implying_closure([tag.id()]);
                stories.retain(|story| !story.tags().is_disjoint(&implying));
            }

            if stories.is_empty() {
                println!("{}", "No stories found.".yellow());
                return Ok(());
            }

            println!(
                "{:<36} | {:<40} | {:<20} | {:<5}",
                "ID", "Title", "Author", "Files"
            );
            println!("{}", "-".repeat(110));
            for story in stories {
                println!(
                    "{:<36} | {:<40} | {:<20} | {:<5}",
                    story.id().to_string(),
                    story.name(),
                    story.author().unwrap_or("-"),
                    story.files().len()
                );
            }
        }
        StoryCommand::Show { id } => {
            show_story(backend, &find_story(backend, id)?)?;
        }
        StoryCommand::Delete { id, keep_files } => {
            let story = find_story(backend, id)?;
            backend.delete_story(story.id())?;

            let story_dir = catalog.layout.story_dir(story.id());
            if !*keep_files && story_dir.exists() {
                fs::remove_dir_all(&story_dir)
                    .with_context(|| format!("Failed to remove {:?}", story_dir))?;
            }
            println!("{} Story '{}' deleted", "✓".green(), story.name());
        }
    }

    Ok(())
}

fn show_story(backend: &dyn CatalogBackend, story: &Story) -> Result<()> {
    println!("{}: {}", "ID".blue(), story.id());
    println!("{}: {}", "Title".blue(), story.name());
    if let Some(author) = story.author() {
        println!("{}: {}", "Author".blue(), author);
    }
    if let Some(url) = story.url() {
        println!("{}: {}", "URL".blue(), url);
    }
    if let Some(description) = story.description() {
        println!("{}: {}", "Description".blue(), description);
    }
    println!(
        "{}: {}",
        "Created".blue(),
        story.created().format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "{}: {}",
        "Updated".blue(),
        story.updated().format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(score) = story.score() {
        println!("{}: {:.0}/100", "Score".blue(), score.value() * 100.0);
    }
    if story.times_read() > 0 {
        println!("{}: {}", "Times read".blue(), story.times_read());
    }

    if !story.tags().is_empty() {
        println!("{}: {}", "Tags".blue(), tag_names(backend, story.tags())?);
        let implied: BTreeSet<TagId> = backend
            .resolve_implied(story.tags())?
            .difference(story.tags())
            .copied()
            .collect();
        if !implied.is_empty() {
            println!("{}: {}", "Implied tags".blue(), tag_names(backend, &implied)?);
        }
    }
    if !story.prequels().is_empty() {
        println!("{}: {}", "Prequels".blue(), story_names(backend, story.prequels())?);
    }
    if !story.sequels().is_empty() {
        println!("{}: {}", "Sequels".blue(), story_names(backend, story.sequels())?);
    }

    let series = backend.series(story.id())?;
    if series.len() > 1 {
        println!("\n{}:", "Series".green());
        for entry in series {
            let marker = if entry.id() == story.id() { "*" } else { " " };
            println!("  {} {}", marker.yellow(), entry.name());
        }
    }

    let files = backend.files_for_story(story.id())?;
    if !files.is_empty() {
        println!("\n{}:", "Files".green());
        for file in files {
            println!(
                "  {} {} ({} bytes, {} words) {}",
                file.file_name().cyan(),
                file.format(),
                file.size(),
                file.word_count(),
                file.sha256()[..12].dimmed()
            );
        }
    }

    Ok(())
}

// ============================================================================
// Import and mappings
// ============================================================================

fn import_story(
    catalog: &Catalog,
    file: &Path,
    options: ficshelf_core::ImportOptions,
) -> Result<()> {
    let json = fs::read_to_string(file)
        .with_context(|| format!("Failed to read imported story {:?}", file))?;
    let imported = read_imported_story(&json)
        .with_context(|| format!("Failed to parse imported story {:?}", file))?;

    let mappings = TagMappingCache::open(catalog.layout.tag_mappings_path())?;
    let importer = Importer::new(catalog.backend.as_ref(), catalog.layout.clone(), &mappings)
        .with_options(options);
    let outcome = importer.import(imported)?;
    mappings.flush();

    println!(
        "{} Imported '{}' ({})",
        "✓".green(),
        outcome.story.name(),
        outcome.story.id()
    );
    for file in &outcome.files {
        println!("  {} {}", "+".green(), file.file_name());
    }
    if let Some(cover) = &outcome.cover {
        println!("  {} {}", "+".green(), cover.display());
    }
    if !outcome.unmapped_tags.is_empty() {
        println!(
            "{} Unmapped tags: {}",
            "!".yellow(),
            outcome.unmapped_tags.join(", ")
        );
        println!("  Use 'ficshelf mapping set <name> <tag>' to map them.");
    }

    Ok(())
}

fn handle_mapping_command(cmd: &MappingCommand, catalog: &Catalog) -> Result<()> {
    let backend = catalog.backend.as_ref();
    let mappings = TagMappingCache::open(catalog.layout.tag_mappings_path())?;

    match cmd {
        MappingCommand::Set { name, tag } => {
            let tag = find_tag(backend, tag)?;
            mappings.update_mappings(backend, &BTreeMap::from([(name.clone(), tag.id())]))?;
            mappings.flush();
            println!("{} '{}' now maps to '{}'", "✓".green(), name, tag.name());
        }
        MappingCommand::Resolve { names } => {
            let resolved = mappings.map_tags(backend, names)?;
            for name in names {
                match resolved.get(name) {
                    Some(id) => {
                        let tag_name = backend
                            .get_tag(*id)?
                            .map(|t| t.name().to_string())
                            .unwrap_or_else(|| id.to_string());
                        println!("{} -> {}", name, tag_name.green());
                    }
                    None => println!("{} -> {}", name, "(unmapped)".yellow()),
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Conversion
// ============================================================================

fn convert_catalog(catalog: &Catalog, to: ficshelf_core::BackendType, dest: &Path) -> Result<()> {
    let same_archive = fs::canonicalize(dest).ok() == fs::canonicalize(catalog.layout.root()).ok();
    if same_archive && to == catalog.backend.backend_type() {
        anyhow::bail!("The archive already uses the {} backend", to);
    }

    let target = create_backend(dest, Some(to))
        .with_context(|| format!("Failed to create {} catalog in {:?}", to, dest))?;
    let stats = target.stats()?;
    if stats.category_count + stats.tag_count + stats.story_count > 0 {
        anyhow::bail!("Destination catalog in {:?} is not empty", dest);
    }

    let summary = copy_catalog(catalog.backend.as_ref(), target.as_ref())?;

    let mut copied_files = 0;
    if !same_archive {
        let dest_layout = ArchiveLayout::new(dest);
        for story in catalog.backend.list_stories()? {
            copied_files += copy_story_contents(&catalog.layout, &dest_layout, story.id())?;
        }
    }

    println!(
        "{} Copied {} categories, {} tags, {} stories and {} file records to {} ({})",
        "✓".green(),
        summary.categories,
        summary.tags,
        summary.stories,
        summary.files,
        dest.display(),
        to
    );
    if copied_files > 0 {
        println!("  {} story file(s) copied", copied_files);
    }
    if summary.dangling_tags > 0 {
        println!(
            "{} Dropped {} reference(s) to deleted tags",
            "!".yellow(),
            summary.dangling_tags
        );
    }

    Ok(())
}

/// Copies a story's files and cover, but not its record
fn copy_story_contents(from: &ArchiveLayout, to: &ArchiveLayout, id: StoryId) -> Result<usize> {
    let source_dir = from.story_dir(id);
    if !source_dir.is_dir() {
        return Ok(0);
    }
    let dest_dir = to.story_dir(id);
    fs::create_dir_all(&dest_dir)?;

    let mut copied = 0;
    for entry in fs::read_dir(&source_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // story.json and its lock/tmp siblings belong to the catalog
        if !path.is_file() || name.starts_with(STORY_RECORD_FILE) {
            continue;
        }
        fs::copy(&path, dest_dir.join(name))
            .with_context(|| format!("Failed to copy {:?}", path))?;
        copied += 1;
    }
    Ok(copied)
}

// ============================================================================
// Settings
// ============================================================================

fn handle_config_command(cmd: &ConfigCommand, settings: &SettingsService) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let current = settings.get();
            let archive = current
                .archive_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "(unknown)".to_string());
            println!("{}: {}", "Archive".blue(), archive);
            println!(
                "{}: {}",
                "Backend".blue(),
                current
                    .backend
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "auto".to_string())
            );
            println!("{}: {} ms", "Import delay".blue(), current.import_delay_ms);
            println!(
                "{}: {}",
                "Auto-update mappings".blue(),
                current.auto_update_mappings
            );
        }
        ConfigCommand::Set {
            archive_dir,
            default_backend,
            import_delay_ms,
            auto_update_mappings,
        } => {
            settings.update(|s| {
                if let Some(dir) = archive_dir {
                    s.archive_dir = Some(dir.clone());
                }
                if let Some(backend) = default_backend {
                    s.backend = Some(*backend);
                }
                if let Some(delay) = import_delay_ms {
                    s.import_delay_ms = *delay;
                }
                if let Some(auto) = auto_update_mappings {
                    s.auto_update_mappings = *auto;
                }
            })?;
            println!("{} Settings saved", "✓".green());
        }
    }

    Ok(())
}
