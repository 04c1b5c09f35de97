use std::cell::RefCell;
use std::rc::Rc;

use nelink::config::{MachineConfig, ProloguePolicy};
use nelink::cpu::MiniCpu;
use nelink::error::{Error, VirtualError};
use nelink::linker::SegmentedModule;
use nelink::machine::Machine;
use nelink::manager::ModuleManager;
use nelink::marshal::{ParamType, ReturnType, Value};
use nelink::memory::SelectorHeap;
use nelink::module::ModuleRef;
use nelink::native::{NativeExport, NativeModule};
use nelink::ne::{AddressType, EntryFlags, EntryPoint, NeImage, Relocation, RelocationKind, Segment};
use pretty_assertions::assert_eq;

type Calls = Rc<RefCell<Vec<(String, String, u16)>>>;

/// Exported entry 1 of HELLO: calls USER.MessageBox(0, "Hi", "Title", 0x30).
fn hello_code() -> Vec<u8> {
    vec![
        0x1E, 0x58, 0x90, // push ds; pop ax; nop
        0x8E, 0xD8, // mov ds, ax
        0xB8, 0x00, 0x00, 0x50, // hwnd
        0x1E, 0xB8, 0x00, 0x00, 0x50, // text
        0x1E, 0xB8, 0x03, 0x00, 0x50, // caption
        0xB8, 0x30, 0x00, 0x50, // flags
        0x9A, 0xFF, 0xFF, 0x00, 0x00, // call far USER.1
        0xCB,
    ]
}

fn hello_image(code: Vec<u8>) -> NeImage {
    let mut image = NeImage::new("HELLO");
    image.file_name = "C:\\HELLO.EXE".to_string();
    image.header.auto_data_segment = 2;
    image.header.init_heap_size = 0x100;
    image.header.init_stack_size = 0x200;
    image.header.entry_point = 0x0001_0000;
    let user = image.add_module_reference("USER");
    image.segments.push(Segment::code(code).with_relocations(vec![Relocation::new(
        RelocationKind::ImportedOrdinal,
        AddressType::Pointer32,
        0x18,
        user,
        1,
    )]));
    image.segments.push(Segment::data(b"Hi\0Title\0".to_vec(), 0x10));
    image.add_entry_point(EntryPoint::new(1, 1, 0, EntryFlags::EXPORTED));
    image.add_export(1, "ShowGreeting");
    image
}

fn user_module(calls: &Calls) -> ModuleRef {
    let calls = calls.clone();
    let message_box = NativeExport::new(1, "MessageBox", move |_: &mut Machine, args: &mut [Value]| {
        match args {
            [Value::U16(_), Value::Str(text), Value::Str(caption), Value::U16(flags)] => {
                calls.borrow_mut().push((text.clone(), caption.clone(), *flags));
                Ok(Value::U16(1))
            }
            other => panic!("unexpected arguments {other:?}"),
        }
    })
    .params([
        ParamType::U16,
        ParamType::Str { file_name: false },
        ParamType::Str { file_name: false },
        ParamType::U16,
    ])
    .returns(ReturnType::U16);
    Rc::new(RefCell::new(
        NativeModule::new("USER").with_file_name("USER.EXE").with_export(message_box),
    ))
}

#[test]
fn executable_calls_native_export_through_thunk() {
    let mut machine = Machine::with_defaults().unwrap();
    let calls = Calls::default();
    let mut manager = ModuleManager::new();
    manager.provide(user_module(&calls));

    let hello: ModuleRef = Rc::new(RefCell::new(SegmentedModule::new(hello_image(hello_code()))));
    manager.register_module(&mut machine, hello.clone()).unwrap();
    assert!(manager.module("user").is_some());
    assert!(Rc::ptr_eq(&manager.module_by_handle(0).unwrap(), &hello));

    hello
        .borrow_mut()
        .as_segmented_mut()
        .unwrap()
        .prepare_run(&mut machine, "", 1)
        .unwrap();
    let (ss, sp) = (machine.regs().ss, machine.regs().sp);
    assert_eq!(sp, 0x210);

    let entry = hello.borrow_mut().proc_address(&mut machine, 1).unwrap().unwrap();
    machine.call_into_guest(entry, "HELLO.ShowGreeting").unwrap();

    assert_eq!(*calls.borrow(), vec![("Hi".to_string(), "Title".to_string(), 0x30)]);
    assert_eq!(machine.regs().ax, 1);
    assert_eq!((machine.regs().ss, machine.regs().sp), (ss, sp));
    assert_eq!(machine.bridge().depth(), 0);

    manager.unload_module(&mut machine, &hello).unwrap();
    assert!(manager.all_modules().is_empty());
}

#[test]
fn strict_link_failure_leaves_nothing_registered() {
    let config = MachineConfig {
        prologue: ProloguePolicy::Strict,
        ..MachineConfig::default()
    };
    let mut machine = Machine::new(config, Box::new(MiniCpu::new()), Box::new(SelectorHeap::new())).unwrap();
    let calls = Calls::default();
    let mut manager = ModuleManager::new();
    manager.provide(user_module(&calls));

    let mut code = hello_code();
    code[0] = 0x55;
    let hello = SegmentedModule::new(hello_image(code));
    let hello: ModuleRef = Rc::new(RefCell::new(hello));

    let err = manager.register_module(&mut machine, hello.clone()).unwrap_err();
    assert!(matches!(err, Error::Virtual(VirtualError::BadPrologue { .. })));
    assert!(err.is_recoverable());
    assert!(manager.all_modules().is_empty());

    let m = hello.borrow();
    assert_eq!(m.state().load_count, 0);
    assert!(m.as_segmented().unwrap().selectors().is_empty());
}
