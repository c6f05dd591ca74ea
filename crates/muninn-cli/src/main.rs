//! muninn is a CLI over the muninn archive core.
//!
//! Extensions (product types, namespaces, remote transports, hooks) are
//! compiled in: downstream distributions register their factories in
//! [`extension_set`] and rebuild. The stock binary ships with an empty
//! set, which is enough for catalogue-only experimentation and for every
//! command that does not need a product type plug-in.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use muninn::{
    Aggregate, Archive, ArchiveConfig, AttachOptions, ExtensionSet, GroupBy, IngestOptions,
    ParameterMap, Properties, SearchOptions, SummaryOptions, Value,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[clap(author, name = "muninn", version)]
struct Muninn {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Args)]
struct ArchiveArgs {
    /// Archive id, or a direct path to a configuration file.
    archive: String,
}

#[derive(Debug, clap::Args)]
struct ExpressionArgs {
    /// Expression selecting the products to operate on.
    expression: String,
    /// Expression parameter bindings, `name=value`.
    #[clap(short = 'e', long = "parameter")]
    parameters: Vec<String>,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Subcommand {
    /// Create the catalogue tables and the storage root
    Prepare {
        #[clap(flatten)]
        archive: ArchiveArgs,
    },
    /// Remove the catalogue and all stored bytes
    Destroy {
        #[clap(flatten)]
        archive: ArchiveArgs,
        /// Confirm destruction of the catalogue
        #[clap(long)]
        catalogue: bool,
        /// Confirm destruction of the stored bytes
        #[clap(long)]
        storage: bool,
    },
    /// Show archive status
    Info {
        #[clap(flatten)]
        archive: ArchiveArgs,
    },
    /// Ingest products into the archive
    Ingest {
        #[clap(flatten)]
        archive: ArchiveArgs,
        /// Paths of the product to ingest
        #[clap(required = true)]
        paths: Vec<PathBuf>,
        /// Product type (identified from the paths when omitted)
        #[clap(short = 't', long = "type")]
        product_type: Option<String>,
        /// Symlink into the archive instead of copying
        #[clap(long)]
        link: bool,
        /// Keep the product where it is (must lie inside the root)
        #[clap(long)]
        keep: bool,
        /// Catalogue only, do not move bytes
        #[clap(long)]
        catalogue_only: bool,
        /// Re-read the stored bytes and verify the content hash
        #[clap(long)]
        verify_hash: bool,
        /// Reclaim a conflicting half-ingested product
        #[clap(long)]
        force: bool,
    },
    /// Re-attach bytes to a stripped catalogue record
    Attach {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(required = true)]
        paths: Vec<PathBuf>,
        #[clap(short = 't', long = "type")]
        product_type: Option<String>,
        #[clap(long)]
        verify_hash: bool,
        /// Skip the size-equality check
        #[clap(long)]
        force: bool,
    },
    /// Fetch remote products into storage
    Pull {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        #[clap(long)]
        verify_hash: bool,
    },
    /// Delete product bytes but keep catalogue records
    Strip {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        #[clap(long)]
        force: bool,
        /// Propagate through the link graph
        #[clap(long)]
        cascade: bool,
    },
    /// Delete products (bytes and catalogue records)
    Remove {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        #[clap(long)]
        force: bool,
        #[clap(long)]
        cascade: bool,
    },
    /// Copy product bytes out of the archive
    Retrieve {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        /// Target directory
        #[clap(short = 'd', long = "directory", default_value = ".")]
        directory: PathBuf,
        #[clap(long)]
        link: bool,
    },
    /// Export products, optionally in a plug-in format
    Export {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        #[clap(short = 'f', long = "format")]
        format: Option<String>,
        #[clap(short = 'd', long = "directory", default_value = ".")]
        directory: PathBuf,
    },
    /// Search the catalogue
    Search {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        /// `±property` ordering terms
        #[clap(short = 'o', long = "order-by")]
        order_by: Vec<String>,
        #[clap(short = 'l', long = "limit")]
        limit: Option<u64>,
        /// Extension namespaces to include
        #[clap(short = 'n', long = "namespace")]
        namespaces: Vec<String>,
        /// Dotted properties to project
        #[clap(short = 'p', long = "property")]
        properties: Vec<String>,
        /// Print the matching product count only
        #[clap(long)]
        count: bool,
    },
    /// Aggregate catalogue statistics
    Summary {
        #[clap(flatten)]
        archive: ArchiveArgs,
        /// Expression filtering the summarized products
        expression: Option<String>,
        #[clap(short = 'e', long = "parameter")]
        parameters: Vec<String>,
        /// Aggregates, `property.func` (e.g. size.sum)
        #[clap(short = 'a', long = "aggregate")]
        aggregates: Vec<String>,
        /// Group-by properties, with optional timestamp subscript
        #[clap(short = 'g', long = "group-by")]
        group_by: Vec<String>,
        #[clap(long)]
        group_by_tag: bool,
        /// Condition over the summary output columns
        #[clap(long)]
        having: Option<String>,
        #[clap(short = 'o', long = "order-by")]
        order_by: Vec<String>,
    },
    /// Attach tags to products
    Tag {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        #[clap(required = true)]
        tags: Vec<String>,
    },
    /// Remove tags from products
    Untag {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        /// Tags to remove; all tags when omitted
        tags: Vec<String>,
    },
    /// List the tags of matching products
    ListTags {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
    },
    /// Update product properties
    Update {
        #[clap(flatten)]
        archive: ArchiveArgs,
        #[clap(flatten)]
        selection: ExpressionArgs,
        /// Property assignments, `ns.field=value` (`field=value` is core)
        #[clap(short = 's', long = "set")]
        set: Vec<String>,
        /// Namespaces to remove
        #[clap(long = "remove-namespace")]
        remove_namespaces: Vec<String>,
        /// Insert missing namespace records instead of failing
        #[clap(long)]
        create_namespaces: bool,
    },
}

/// Extension factories compiled into this binary.
fn extension_set() -> ExtensionSet {
    ExtensionSet::new()
}

fn open(archive: &ArchiveArgs) -> anyhow::Result<Archive> {
    let path = ArchiveConfig::locate(&archive.archive, None)?;
    let config = ArchiveConfig::load(&path)?;
    Ok(Archive::open_with_config(&config, &extension_set())?)
}

fn parse_parameters(bindings: &[String]) -> anyhow::Result<ParameterMap> {
    let mut parameters = ParameterMap::new();
    for binding in bindings {
        let (name, text) = binding
            .split_once('=')
            .with_context(|| format!("parameter {:?} is not name=value", binding))?;
        parameters.insert(name.to_string(), parse_value_guess(text));
    }
    Ok(parameters)
}

/// Untyped CLI input: try the literal forms from most to least specific.
fn parse_value_guess(text: &str) -> Value {
    use muninn::DataType::*;
    for data_type in [Boolean, Long64, Real, Uuid, Timestamp, Geometry] {
        if let Ok(value) = Value::parse(data_type, text) {
            return value;
        }
    }
    Value::Text(text.to_string())
}

async fn resolve_uuids(
    archive: &mut Archive,
    selection: &ExpressionArgs,
) -> anyhow::Result<Vec<Uuid>> {
    let parameters = parse_parameters(&selection.parameters)?;
    let options = SearchOptions {
        property_names: Some(vec!["uuid".to_string()]),
        ..Default::default()
    };
    let rows = archive
        .search(Some(selection.expression.as_str()), &parameters, &options)
        .await?;
    Ok(rows.iter().filter_map(Properties::uuid).collect())
}

fn progress(len: usize, label: &str) -> indicatif::ProgressBar {
    if atty::is(atty::Stream::Stderr) && len > 1 {
        let bar = indicatif::ProgressBar::new(len as u64);
        bar.set_message(label.to_string());
        bar
    } else {
        indicatif::ProgressBar::hidden()
    }
}

async fn run(subcommand: Subcommand) -> anyhow::Result<()> {
    match subcommand {
        Subcommand::Prepare { archive } => {
            let mut archive = open(&archive)?;
            archive.prepare().await?;
            println!("archive prepared");
        }
        Subcommand::Destroy {
            archive,
            catalogue,
            storage,
        } => {
            anyhow::ensure!(
                catalogue && storage,
                "pass --catalogue --storage to confirm destroying both"
            );
            let mut archive = open(&archive)?;
            archive.destroy().await?;
            println!("archive destroyed");
        }
        Subcommand::Info { archive } => {
            let mut archive = open(&archive)?;
            let prepared = archive.catalogue_exists().await?;
            println!("prepared: {}", prepared);
            if prepared {
                let count = archive.count(None, &ParameterMap::new()).await?;
                println!("products: {}", count);
            }
        }
        Subcommand::Ingest {
            archive,
            paths,
            product_type,
            link,
            keep,
            catalogue_only,
            verify_hash,
            force,
        } => {
            let mut archive = open(&archive)?;
            let options = IngestOptions {
                product_type,
                properties: None,
                ingest_product: !catalogue_only,
                use_symlinks: link.then_some(true),
                use_current_path: keep,
                verify_hash,
                force,
            };
            let properties = archive.ingest(&paths, options).await?;
            println!("{}", properties.to_json());
        }
        Subcommand::Attach {
            archive,
            paths,
            product_type,
            verify_hash,
            force,
        } => {
            let mut archive = open(&archive)?;
            let options = AttachOptions {
                product_type,
                use_symlinks: None,
                verify_hash,
                force,
            };
            let properties = archive.attach(&paths, options).await?;
            println!("{}", properties.to_json());
        }
        Subcommand::Pull {
            archive,
            selection,
            verify_hash,
        } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            let bar = progress(uuids.len(), "pulling");
            for uuid in uuids {
                archive.pull(uuid, verify_hash).await?;
                bar.inc(1);
            }
            bar.finish_and_clear();
        }
        Subcommand::Strip {
            archive,
            selection,
            force,
            cascade,
        } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            let bar = progress(uuids.len(), "stripping");
            for uuid in uuids {
                archive.strip(uuid, force, cascade).await?;
                bar.inc(1);
            }
            bar.finish_and_clear();
        }
        Subcommand::Remove {
            archive,
            selection,
            force,
            cascade,
        } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            let bar = progress(uuids.len(), "removing");
            for uuid in uuids {
                archive.remove(uuid, force, cascade).await?;
                bar.inc(1);
            }
            bar.finish_and_clear();
        }
        Subcommand::Retrieve {
            archive,
            selection,
            directory,
            link,
        } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            let bar = progress(uuids.len(), "retrieving");
            for uuid in uuids {
                for path in archive.retrieve(uuid, &directory, link).await? {
                    println!("{}", path.display());
                }
                bar.inc(1);
            }
            bar.finish_and_clear();
        }
        Subcommand::Export {
            archive,
            selection,
            format,
            directory,
        } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            let bar = progress(uuids.len(), "exporting");
            for uuid in uuids {
                let path = archive.export(uuid, format.as_deref(), &directory).await?;
                println!("{}", path.display());
                bar.inc(1);
            }
            bar.finish_and_clear();
        }
        Subcommand::Search {
            archive,
            selection,
            order_by,
            limit,
            namespaces,
            properties,
            count,
        } => {
            let mut archive = open(&archive)?;
            let parameters = parse_parameters(&selection.parameters)?;
            if count {
                let n = archive
                    .count(Some(selection.expression.as_str()), &parameters)
                    .await?;
                println!("{}", n);
                return Ok(());
            }
            let options = SearchOptions {
                namespaces,
                order_by,
                limit,
                property_names: if properties.is_empty() {
                    None
                } else {
                    Some(properties)
                },
            };
            let rows = archive
                .search(Some(selection.expression.as_str()), &parameters, &options)
                .await?;
            for row in rows {
                println!("{}", row.to_json());
            }
        }
        Subcommand::Summary {
            archive,
            expression,
            parameters,
            aggregates,
            group_by,
            group_by_tag,
            having,
            order_by,
        } => {
            let mut archive = open(&archive)?;
            let bindings = parse_parameters(&parameters)?;
            let schema = archive.schema();
            let options = SummaryOptions {
                aggregates: aggregates
                    .iter()
                    .map(|text| Aggregate::parse(text))
                    .collect::<muninn::Result<_>>()?,
                group_by: group_by
                    .iter()
                    .map(|text| GroupBy::parse(text, &schema))
                    .collect::<muninn::Result<_>>()?,
                group_by_tag,
                having,
                order_by,
            };
            let summary = archive
                .summary(expression.as_deref(), &bindings, &options)
                .await?;
            let header: Vec<&str> = summary
                .columns
                .iter()
                .map(|(name, _)| name.as_str())
                .collect();
            println!("{}", header.join("\t"));
            for row in summary.rows {
                let cells: Vec<String> = row
                    .iter()
                    .map(|value| match value {
                        Some(value) => value.to_string(),
                        None => String::new(),
                    })
                    .collect();
                println!("{}", cells.join("\t"));
            }
        }
        Subcommand::Tag {
            archive,
            selection,
            tags,
        } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            for uuid in uuids {
                archive.tag(uuid, &tags).await?;
            }
        }
        Subcommand::Untag {
            archive,
            selection,
            tags,
        } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            let tags = if tags.is_empty() { None } else { Some(tags) };
            for uuid in uuids {
                archive.untag(uuid, tags.as_deref()).await?;
            }
        }
        Subcommand::ListTags { archive, selection } => {
            let mut archive = open(&archive)?;
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            for uuid in uuids {
                let tags = archive.list_tags(uuid).await?;
                println!("{}: {}", uuid, tags.join(", "));
            }
        }
        Subcommand::Update {
            archive,
            selection,
            set,
            remove_namespaces,
            create_namespaces,
        } => {
            let mut archive = open(&archive)?;
            let schema = archive.schema();
            let mut update = Properties::new();
            for assignment in &set {
                let (reference, text) = assignment
                    .split_once('=')
                    .with_context(|| format!("assignment {:?} is not property=value", assignment))?;
                let (namespace, field) = muninn::properties::split_reference(reference);
                let definition = schema.resolve(namespace, field)?;
                let value = Value::parse(definition.data_type, text)
                    .with_context(|| format!("cannot parse value for {}", reference))?;
                update.set(namespace, field, value);
            }
            for namespace in &remove_namespaces {
                update.clear_namespace(namespace);
            }
            let uuids = resolve_uuids(&mut archive, &selection).await?;
            let bar = progress(uuids.len(), "updating");
            for uuid in uuids {
                archive
                    .update_properties(uuid, &update, create_namespaces)
                    .await?;
                bar.inc(1);
            }
            bar.finish_and_clear();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Muninn { subcommand } = Muninn::parse();
    if let Err(err) = run(subcommand).await {
        tracing::error!(error = ?err, "command failed");
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
