use crash_dumper::{
    CrashDumper, DumpKind, DumpWriter, DumperConfig, Error, WriteRequest, WriterLoader,
};
use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

static COUNTING: AtomicBool = AtomicBool::new(false);
static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Set on the thread asking for the dump, its own allocations don't count
    static REQUESTER: Cell<bool> = const { Cell::new(false) };
}

struct CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if COUNTING.load(Ordering::Relaxed) && !REQUESTER.try_with(Cell::get).unwrap_or(true) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }

        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

struct HeaplessWriter;

impl DumpWriter for HeaplessWriter {
    fn write_dump(&mut self, request: WriteRequest<'_>) -> Result<(), Error> {
        use std::io::Write;
        request.file.write_all(b"MDMP")?;
        Ok(())
    }
}

struct HeaplessLoader;

impl WriterLoader for HeaplessLoader {
    fn load(&self) -> Result<Box<dyn DumpWriter>, Error> {
        Ok(Box::new(HeaplessWriter))
    }
}

#[test]
fn dump_thread_doesnt_allocate() {
    let td = tempfile::tempdir().unwrap();

    let mut dumper = CrashDumper::new(
        DumperConfig::default()
            .install_fault_filter(false)
            .build_id("feature/alloc"),
    );
    dumper.init_with_loader(td.path(), &HeaplessLoader);
    assert!(dumper.is_initialized());

    REQUESTER.with(|r| r.set(true));

    COUNTING.store(true, Ordering::SeqCst);
    dumper.trigger_dump(DumpKind::Minimal);
    COUNTING.store(false, Ordering::SeqCst);

    assert_eq!(ALLOCATIONS.load(Ordering::SeqCst), 0);

    let dumps: Vec<_> = std::fs::read_dir(dumper.dump_directory().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(dumps.len(), 1);
    assert!(dumps[0].starts_with("CrashMZ-"));
    assert!(dumps[0].contains("-feature_alloc-pid"));

    dumper.shutdown();
}
