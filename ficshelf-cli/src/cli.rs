use clap::{Parser, Subcommand};
use ficshelf_core::BackendType;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "A catalog for locally archived stories")]
pub struct Cli {
    /// Archive directory (defaults to the configured archive)
    #[clap(long, global = true)]
    pub archive: Option<PathBuf>,

    /// Storage backend: json or sqlite (inferred from the archive when omitted)
    #[clap(long, global = true)]
    pub backend: Option<BackendType>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum CategoryCommand {
    /// Add a tag category
    Add {
        /// Name of the category
        name: String,

        /// Description of the category
        #[clap(long)]
        description: Option<String>,

        /// Display colour as #rrggbb
        #[clap(long)]
        color: Option<String>,

        /// Position in category listings
        #[clap(long)]
        sort_order: Option<i32>,
    },

    /// List all categories
    List,

    /// Delete a category
    Delete {
        /// Name or ID of the category
        name: String,

        /// Move the category's tags to this category first
        #[clap(long)]
        move_to: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TagCommand {
    /// Add a tag
    Add {
        /// Name of the tag
        name: String,

        /// Category name or ID
        #[clap(long, short = 'c')]
        category: String,

        /// Description of the tag
        #[clap(long)]
        description: Option<String>,

        /// Comma-separated tags implied by this one
        #[clap(long)]
        implies: Option<String>,
    },

    /// List tags
    List {
        /// Only tags in this category
        #[clap(long, short = 'c')]
        category: Option<String>,

        /// With --category, also include tags implying a tag of the category
        #[clap(long)]
        implied: bool,
    },

    /// Show details for a tag
    Show {
        /// Name or ID of the tag
        name: String,
    },

    /// Delete a tag
    Delete {
        /// Name or ID of the tag
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum StoryCommand {
    /// Add a story by hand
    Add {
        /// Title of the story
        name: String,

        #[clap(long)]
        author: Option<String>,

        #[clap(long)]
        url: Option<String>,

        #[clap(long)]
        description: Option<String>,

        /// Comma-separated tag names
        #[clap(long)]
        tags: Option<String>,

        /// Name or ID of the story this one continues
        #[clap(long)]
        sequel_of: Option<String>,
    },

    /// List stories
    List {
        /// Only stories carrying this tag, directly or by implication
        #[clap(long)]
        tag: Option<String>,
    },

    /// Show details for a story
    Show {
        /// Name or ID of the story
        id: String,
    },

    /// Delete a story
    Delete {
        /// Name or ID of the story
        id: String,

        /// Leave the story's files in the archive
        #[clap(long)]
        keep_files: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum MappingCommand {
    /// Remember that a scraped tag name means an existing tag
    Set {
        /// Scraped tag name
        name: String,

        /// Name or ID of the existing tag
        tag: String,
    },

    /// Show which tags the given names map to
    Resolve {
        #[clap(required = true)]
        names: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the current settings
    Show,

    /// Change settings
    Set {
        /// Default archive directory
        #[clap(long)]
        archive_dir: Option<PathBuf>,

        /// Default storage backend
        #[clap(long)]
        default_backend: Option<BackendType>,

        /// Pause between sequential imports, in milliseconds
        #[clap(long)]
        import_delay_ms: Option<u64>,

        /// Remember tag names resolved during import
        #[clap(long)]
        auto_update_mappings: Option<bool>,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage tag categories
    #[clap(subcommand)]
    Category(CategoryCommand),

    /// Manage tags
    #[clap(subcommand)]
    Tag(TagCommand),

    /// Manage stories
    #[clap(subcommand)]
    Story(StoryCommand),

    /// Import a story from an imported-story JSON file
    Import {
        /// Path to the JSON file
        file: PathBuf,

        /// Do not remember the tag names resolved by this import
        #[clap(long)]
        no_mappings: bool,
    },

    /// Manage the tag-name mapping cache
    #[clap(subcommand)]
    Mapping(MappingCommand),

    /// Copy the catalog into another archive or backend
    Convert {
        /// Backend of the new catalog
        #[clap(long)]
        to: BackendType,

        /// Archive directory of the new catalog
        dest: PathBuf,
    },

    /// Export the whole catalog to a JSON snapshot
    Export {
        /// Output file
        file: PathBuf,
    },

    /// Show catalog statistics
    Stats,

    /// Manage settings
    #[clap(subcommand)]
    Config(ConfigCommand),
}
