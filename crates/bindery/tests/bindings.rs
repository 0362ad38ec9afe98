use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use bindery::declarative::Observer;
use bindery::{
    ClassBuilder, CompilationContext, CompileError, CompiledUnit, DeclarativeObject,
    DynamicScopeKey, ErrorKind, HandlerPair, IsaRevision, Module, Operator, OperatorMap,
    ReadHandler, RuntimeError, SourceKind, Value,
};

fn contexts() -> Vec<CompilationContext> {
    [IsaRevision::Classic, IsaRevision::Compact]
        .into_iter()
        .map(|revision| CompilationContext::new(revision.target()))
        .collect()
}

/// A free-standing object published as the module global `name`.
fn model(context: &CompilationContext, module: &Rc<Module>, name: &str) -> Rc<DeclarativeObject> {
    let object = ClassBuilder::new(context, module, "Model")
        .attr("level", Value::Int(1))
        .build()
        .instantiate();
    module.set_global(name, Value::Object(object.clone()));
    object
}

#[derive(Default)]
struct Changes(RefCell<Vec<String>>);

impl Observer for Changes {
    fn notify(&self, change: &Value) -> Result<(), RuntimeError> {
        self.0.borrow_mut().push(change.repr());
        Ok(())
    }
}

#[test]
fn written_values_read_back_through_the_same_path() {
    for context in contexts() {
        let module = Module::new("roundtrip");
        module.set_global("store", Value::record([("value".into(), Value::Int(0))]));
        let object = ClassBuilder::new(&context, &module, "Field")
            .attr("text", Value::Int(0))
            .attr("mirror", Value::None)
            .bind("text", ">>", "store.value", 1)
            .unwrap()
            .bind("mirror", "=", "store.value", 2)
            .unwrap()
            .build()
            .instantiate();
        object.set_attr("text", Value::Int(5)).unwrap();
        assert_eq!(object.get_attr("mirror").unwrap(), Value::Int(5));
    }
}

#[test]
fn subscript_writes_read_back() {
    for context in contexts() {
        let module = Module::new("roundtrip");
        let items = Value::list(vec![Value::Int(0); 3]);
        module.set_global("items", items.clone());
        let object = ClassBuilder::new(&context, &module, "Cell")
            .attr("text", Value::Int(0))
            .attr("mirror", Value::None)
            .bind("text", ">>", "items[1]", 1)
            .unwrap()
            .bind("mirror", "=", "items[1]", 2)
            .unwrap()
            .build()
            .instantiate();
        object.set_attr("text", Value::Int(7)).unwrap();
        assert_eq!(object.get_attr("mirror").unwrap(), Value::Int(7));
        assert_eq!(items, Value::list(vec![Value::Int(0), Value::Int(7), Value::Int(0)]));
    }
}

#[test]
fn getattr_writes_read_back() {
    for context in contexts() {
        let module = Module::new("roundtrip");
        module.set_global("store", Value::record([("value".into(), Value::Int(0))]));
        let object = ClassBuilder::new(&context, &module, "Field")
            .attr("text", Value::Int(0))
            .attr("mirror", Value::None)
            .bind("text", ">>", "getattr(store, 'value')", 1)
            .unwrap()
            .bind("mirror", "=", "getattr(store, 'value')", 2)
            .unwrap()
            .build()
            .instantiate();
        object.set_attr("text", Value::str("typed")).unwrap();
        assert_eq!(object.get_attr("mirror").unwrap(), Value::str("typed"));
    }
}

#[test]
fn bare_name_writes_reach_the_declaring_ancestor() {
    for context in contexts() {
        let module = Module::new("roundtrip");
        let field = ClassBuilder::new(&context, &module, "Field")
            .attr("text", Value::None)
            .attr("mirror", Value::None)
            .bind("text", ">>", "title", 1)
            .unwrap()
            .bind("mirror", "=", "title", 2)
            .unwrap()
            .build();
        let form = ClassBuilder::new(&context, &module, "Form")
            .attr("title", Value::str("untitled"))
            .child(field)
            .build()
            .instantiate();
        let field = form.children()[0].clone();
        field.set_attr("text", Value::str("invoice")).unwrap();
        assert_eq!(form.get_attr("title").unwrap(), Value::str("invoice"));
        assert_eq!(field.get_attr("mirror").unwrap(), Value::str("invoice"));
    }
}

#[test]
fn subscriptions_follow_their_dependencies() {
    for context in contexts() {
        let module = Module::new("subscribe");
        let object = ClassBuilder::new(&context, &module, "Counter")
            .attr("x", Value::Int(1))
            .attr("y", Value::None)
            .bind("y", "<<", "x + 1", 1)
            .unwrap()
            .build()
            .instantiate();
        let changes = Rc::new(Changes::default());
        object.observe("y", changes.clone());

        assert_eq!(object.get_attr("y").unwrap(), Value::Int(2));
        object.set_attr("x", Value::Int(2)).unwrap();
        assert_eq!(object.get_attr("y").unwrap(), Value::Int(3));
        assert_eq!(
            *changes.0.borrow(),
            vec![
                "namespace(type='update', object=<Counter object>, name='y', oldvalue=2, value=3)"
                    .to_owned()
            ]
        );
    }
}

#[test]
fn subscriptions_reach_other_objects() {
    for context in contexts() {
        let module = Module::new("remote");
        let source = model(&context, &module, "source");
        let object = ClassBuilder::new(&context, &module, "Label")
            .attr("text", Value::None)
            .bind("text", "<<", "'level ' + str(source.level)", 1)
            .unwrap()
            .build()
            .instantiate();
        assert_eq!(object.get_attr("text").unwrap(), Value::str("level 1"));
        source.set_attr("level", Value::Int(4)).unwrap();
        assert_eq!(object.get_attr("text").unwrap(), Value::str("level 4"));
    }
}

#[test]
fn delegation_reads_and_writes_the_same_attribute() {
    for context in contexts() {
        let module = Module::new("delegate");
        let source = model(&context, &module, "source");
        let object = ClassBuilder::new(&context, &module, "Slider")
            .attr("value", Value::None)
            .bind("value", ":=", "source.level", 1)
            .unwrap()
            .build()
            .instantiate();
        assert_eq!(object.get_attr("value").unwrap(), Value::Int(1));
        object.set_attr("value", Value::Int(7)).unwrap();
        assert_eq!(source.get_attr("level").unwrap(), Value::Int(7));
        source.set_attr("level", Value::Int(9)).unwrap();
        assert_eq!(object.get_attr("value").unwrap(), Value::Int(9));
    }
}

#[test]
fn notifications_see_the_change_and_keep_locals_private() {
    for context in contexts() {
        let module = Module::new("notify");
        module.set_global("seen", Value::list(Vec::new()));
        let object = ClassBuilder::new(&context, &module, "Button")
            .attr("count", Value::Int(0))
            .event("clicked")
            .bind(
                "clicked",
                "::",
                "step = change.value\nself.count += step\nseen.append(change.name)\n",
                1,
            )
            .unwrap()
            .build()
            .instantiate();
        object.set_attr("clicked", Value::Int(2)).unwrap();
        object.set_attr("clicked", Value::Int(3)).unwrap();
        assert_eq!(object.get_attr("count").unwrap(), Value::Int(5));
        assert_eq!(
            module.global("seen").map(|seen| seen.repr()),
            Some("['clicked', 'clicked']".to_owned())
        );
        assert!(object.get_attr("step").unwrap_err().is_attribute_error());
        assert_eq!(module.global("step"), None);
    }
}

#[test]
fn reader_errors_reach_the_caller() {
    let context = CompilationContext::host();
    let module = Module::new("errors");
    let object = ClassBuilder::new(&context, &module, "Broken")
        .attr("value", Value::None)
        .bind("value", "=", "missing + 1", 1)
        .unwrap()
        .build()
        .instantiate();
    let error = object.get_attr("value").unwrap_err();
    assert_eq!(error.kind, ErrorKind::ScopeResolution { name: "missing".into() });
}

#[derive(Debug)]
struct Fixed;

impl ReadHandler for Fixed {
    fn get(&self, _owner: &Rc<DeclarativeObject>, _name: &str) -> Result<Value, RuntimeError> {
        Ok(Value::str("fixed"))
    }
}

fn fixed(
    _unit: &Arc<CompiledUnit>,
    _key: DynamicScopeKey,
    _context: &CompilationContext,
) -> Result<HandlerPair, CompileError> {
    Ok(HandlerPair::reader(Fixed))
}

#[test]
fn operator_overrides_apply_until_popped() {
    let context = CompilationContext::host();
    let module = Module::new("overrides");
    let widget = |context: &CompilationContext| {
        ClassBuilder::new(context, &module, "Widget")
            .attr("title", Value::None)
            .bind("title", "=", "'computed'", 1)
            .unwrap()
            .build()
            .instantiate()
            .get_attr("title")
            .unwrap()
    };

    let overrides = OperatorMap::new().with(Operator::new("=", SourceKind::Expression, fixed));
    context.push_operators(overrides, true);
    assert_eq!(widget(&context), Value::str("fixed"));
    assert!(context.operator("<<").is_some());
    assert!(context.pop_operators().is_some());
    assert_eq!(widget(&context), Value::str("computed"));
}
