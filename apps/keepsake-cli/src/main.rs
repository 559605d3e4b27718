use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use glam::{Quat, Vec3};
use keepsake_common::{Transform, tags};
use keepsake_kernel::{EntityRole, EntityTemplate, World, WorldHost};
use keepsake_persist::{
    ArchiveKind, Artifact, FieldType, FileBackend, KeyLayout, LoadMethod, MemoryBackend, PersistError,
    SaveEngine, SchemaRegistry, Settings, StorageBackend, TypeRegistry, TypeSchema, decode_unit,
};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keepsake-cli", about = "Inspect and manage keepsake save directories")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Save directory root
    #[arg(short, long, default_value = "saves")]
    root: PathBuf,

    /// Settings file (.yaml, .yml or .json)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Save user namespace
    #[arg(short, long)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List slots, most recently saved first
    Slots,
    /// List save users
    Users,
    /// Show versions, sizes and digests of a slot's archives
    Inspect { slot: String },
    /// Delete a slot and everything stored with it
    DeleteSlot { slot: String },
    /// Delete a save user and all their slots
    DeleteUser { user: String },
    /// Save a scripted world, restore it into a fresh one and compare
    Demo {
        /// Load scheduling to restore with
        #[arg(short, long, default_value = "immediate")]
        method: String,
        /// Run against the save directory instead of memory
        #[arg(long)]
        persist: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    match cli.command {
        Commands::Slots => {
            let mut engine = open_engine(&cli.root, settings, cli.user.as_deref())?;
            for slot in engine.list_slots()? {
                match engine.slot_info(Some(&slot))? {
                    Some(info) => println!(
                        "{slot}\t{}\t{}\t{}",
                        info.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        info.region,
                        info.players.join(",")
                    ),
                    None => println!("{slot}\t-"),
                }
            }
        }
        Commands::Users => {
            let mut engine = open_engine(&cli.root, settings, None)?;
            for user in engine.list_users()? {
                println!("{user}");
            }
        }
        Commands::Inspect { slot } => {
            let backend = FileBackend::open(&cli.root)?;
            inspect(&backend, &settings, cli.user.as_deref(), &slot)?;
        }
        Commands::DeleteSlot { slot } => {
            let mut engine = open_engine(&cli.root, settings, cli.user.as_deref())?;
            let removed = engine.delete_slot(&slot)?;
            println!("removed {removed} file(s) from slot {slot}");
        }
        Commands::DeleteUser { user } => {
            let mut engine = open_engine(&cli.root, settings, None)?;
            let removed = engine.delete_user(&user)?;
            println!("removed {removed} file(s) of user {user}");
        }
        Commands::Demo { method, persist } => {
            let method = match method.to_ascii_lowercase().as_str() {
                "immediate" => LoadMethod::Immediate,
                "deferred" => LoadMethod::Deferred,
                "threaded" => LoadMethod::Threaded,
                other => anyhow::bail!("unknown load method {other:?}"),
            };
            let settings = Settings {
                load_method: method,
                ..settings
            };
            let backend: Arc<dyn StorageBackend> = if persist {
                Arc::new(FileBackend::open(&cli.root)?)
            } else {
                Arc::new(MemoryBackend::new())
            };
            demo(backend, settings)?;
        }
    }

    Ok(())
}

fn open_engine(root: &Path, settings: Settings, user: Option<&str>) -> anyhow::Result<SaveEngine> {
    let backend = Arc::new(FileBackend::open(root)?);
    let mut engine = SaveEngine::new(settings, backend, TypeRegistry::new(), SchemaRegistry::new());
    if user.is_some() && !engine.switch_user(user)? {
        anyhow::bail!("save users are not available with this backend style");
    }
    Ok(engine)
}

fn inspect(backend: &dyn StorageBackend, settings: &Settings, user: Option<&str>, slot: &str) -> anyhow::Result<()> {
    let layout = KeyLayout::new(settings, user);
    let units = [
        (Artifact::Player, ArchiveKind::Player),
        (Artifact::Level, ArchiveKind::Level),
        (Artifact::Slot, ArchiveKind::Slot),
    ];
    let mut found = 0;
    for (artifact, kind) in units {
        let key = layout.slot_key(slot, artifact);
        let name = artifact.suffix();
        let bytes = match backend.get(&key) {
            Ok(bytes) => bytes,
            Err(PersistError::StorageMissing { .. }) => {
                println!("{name:<7} missing");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        found += 1;
        let digest = Sha256::digest(&bytes);
        match decode_unit(settings, &bytes, kind) {
            Ok(unit) => {
                let tag = unit
                    .tag
                    .map(|t| format!("{} {}", t.plugin, t.game))
                    .unwrap_or_else(|| "untagged".to_owned());
                println!(
                    "{name:<7} {} bytes, body {} bytes, format {}{}, engine {}.{}.{}, {tag}, sha256 {digest:x}",
                    bytes.len(),
                    unit.body.len(),
                    unit.header.format.0,
                    if unit.header.is_legacy { " (legacy)" } else { "" },
                    unit.header.env.major,
                    unit.header.env.minor,
                    unit.header.env.patch,
                );
            }
            Err(e) => println!("{name:<7} {} bytes, unreadable: {e}, sha256 {digest:x}", bytes.len()),
        }
    }
    if found == 0 {
        anyhow::bail!("slot {slot:?} has no archives");
    }
    Ok(())
}

fn demo_schemas() -> SchemaRegistry {
    let mut schemas = SchemaRegistry::new();
    schemas.register(TypeSchema::new("/Game/Door").persisted("Open", FieldType::Scalar));
    schemas.register(TypeSchema::new("/Game/Bot").persisted("Health", FieldType::Scalar));
    schemas.register(
        TypeSchema::new("/Game/Hero")
            .persisted("Stamina", FieldType::Scalar)
            .transient("Target", FieldType::Scalar),
    );
    schemas.register(TypeSchema::new("/Game/Controller"));
    schemas
}

fn demo_world() -> anyhow::Result<World> {
    let mut world = World::new("Level1");
    for i in 0..4 {
        world.place(
            EntityTemplate::new("/Game/Door"),
            &format!("Door_{i}"),
            "Level1",
            Transform::from_position(Vec3::new(i as f32 * 3.0, 0.0, 0.0)),
        )?;
    }
    let mut controller = EntityTemplate::new("/Game/Controller");
    controller.role = EntityRole::PlayerController;
    world.spawn(controller, "PC", Transform::IDENTITY)?;
    let mut hero = EntityTemplate::new("/Game/Hero");
    hero.role = EntityRole::Pawn { player_controlled: true };
    world.spawn(hero, "Hero", Transform::IDENTITY)?;
    Ok(world)
}

fn demo(backend: Arc<dyn StorageBackend>, settings: Settings) -> anyhow::Result<()> {
    let mut types = TypeRegistry::new();
    types.register_template(EntityTemplate::new("/Game/Bot"));

    let mut played = demo_world()?;
    for name in ["Door_1", "Door_3"] {
        if let Some(id) = played.id_of(name) {
            played.set_field(id, "Open", true);
        }
    }
    for i in 0..3 {
        let id = played.spawn(
            EntityTemplate::new("/Game/Bot"),
            &format!("Bot_{i}"),
            Transform::from_position(Vec3::new(0.0, i as f32 * 5.0, 0.0)),
        )?;
        played.set_field(id, "Health", 100 - i * 25);
    }
    if let Some(hero) = played.id_of("Hero") {
        played.set_field(hero, "Stamina", 42);
        played.set_transform(hero, Transform::from_position(Vec3::new(8.0, 1.0, 0.0)));
    }
    played.set_control_rotation(Quat::from_rotation_z(1.0));
    if let Some(door) = played.id_of("Door_0") {
        played.add_tag(door, tags::SKIP_SAVE);
    }

    let mut saver = SaveEngine::new(settings.clone(), Arc::clone(&backend), types.clone(), demo_schemas());
    saver.set_current_slot("Demo");
    if !saver.capture_session_snapshot(&mut played, true, true)? {
        anyhow::bail!("save was rejected");
    }

    let mut loader = SaveEngine::new(settings, backend, types, demo_schemas());
    loader.set_current_slot("Demo");
    let mut restored = demo_world()?;
    if !loader.restore_session_snapshot(&mut restored, true, true, false, None)? {
        anyhow::bail!("nothing was restored");
    }
    while loader.is_loading() {
        loader.tick(&mut restored)?;
    }

    if let Some(report) = loader.last_report() {
        for (outcome, count) in report.counts() {
            println!("{outcome:?}: {count}");
        }
    }
    let mut mismatched = 0;
    for data in played.entities().values() {
        let Some(id) = restored.id_of(&data.name) else {
            println!("{}: missing after restore", data.name);
            mismatched += 1;
            continue;
        };
        let Some(other) = restored.get(id) else {
            continue;
        };
        if other.fields != data.fields || !other.transform.position.abs_diff_eq(data.transform.position, 1e-4) {
            println!("{}: differs after restore", data.name);
            mismatched += 1;
        }
    }
    println!(
        "{} entities compared: {}",
        played.entity_count(),
        if mismatched == 0 { "OK" } else { "MISMATCH" }
    );
    Ok(())
}
