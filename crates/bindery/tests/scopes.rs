use std::rc::Rc;

use bindery::vm;
use bindery::{
    ClassBuilder, CompilationContext, DeclarativeObject, ErrorKind, IsaRevision, Module, Value,
};

struct Tree {
    _module: Rc<Module>,
    root: Rc<DeclarativeObject>,
    leaf: Rc<DeclarativeObject>,
}

/// A window holding one button; the button's bindings reach the window
/// through the dynamic scope.
fn tree(revision: IsaRevision) -> Tree {
    let context = CompilationContext::new(revision.target());
    let module = Module::new("tree");
    module
        .exec(&context, "suffix = '!'\ndef shout(text):\n    return text + suffix\n")
        .unwrap();
    let button = ClassBuilder::new(&context, &module, "Button")
        .attr("caption", Value::None)
        .event("clicked")
        .bind("caption", "<<", "shout(title)", 1)
        .unwrap()
        .bind("clicked", "::", "nonlocals.title = change.value\nnonlocals(1).clicks += 1\n", 2)
        .unwrap()
        .function("def describe():\n    return caption + ' in ' + parent.title\n", 4)
        .unwrap()
        .build();
    let window = ClassBuilder::new(&context, &module, "Window")
        .attr("title", Value::str("main"))
        .attr("clicks", Value::Int(0))
        .child(button)
        .build()
        .instantiate();
    let leaf = window.children()[0].clone();
    Tree {
        _module: module,
        root: window,
        leaf,
    }
}

#[test]
fn bindings_read_and_follow_ancestors() {
    for revision in [IsaRevision::Classic, IsaRevision::Compact] {
        let tree = tree(revision);
        assert_eq!(tree.leaf.get_attr("caption").unwrap(), Value::str("main!"));
        tree.root.set_attr("title", Value::str("settings")).unwrap();
        assert_eq!(tree.leaf.get_attr("caption").unwrap(), Value::str("settings!"));
    }
}

#[test]
fn notifications_write_through_nonlocals() {
    for revision in [IsaRevision::Classic, IsaRevision::Compact] {
        let tree = tree(revision);
        tree.leaf.set_attr("clicked", Value::str("renamed")).unwrap();
        assert_eq!(tree.root.get_attr("title").unwrap(), Value::str("renamed"));
        assert_eq!(tree.root.get_attr("clicks").unwrap(), Value::Int(1));
        assert_eq!(tree.leaf.get_attr("caption").unwrap(), Value::str("renamed!"));
    }
}

#[test]
fn declarative_functions_share_the_binding_scope() {
    let tree = tree(IsaRevision::host());
    let describe = tree.leaf.get_attr("describe").unwrap();
    let text = vm::call(&describe, Vec::new(), Vec::new()).unwrap();
    assert_eq!(text, Value::str("main! in main"));
}

#[test]
fn out_of_range_scope_levels_are_errors() {
    let context = CompilationContext::host();
    let module = Module::new("levels");
    let object = ClassBuilder::new(&context, &module, "Lonely")
        .event("poke")
        .bind("poke", "::", "nonlocals(3).value = 1\n", 1)
        .unwrap()
        .build()
        .instantiate();
    let error = object.set_attr("poke", Value::None).unwrap_err();
    assert_eq!(
        error.kind,
        ErrorKind::Value("scope level 3 is out of range".into())
    );
}
