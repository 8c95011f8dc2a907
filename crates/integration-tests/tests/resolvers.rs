#![allow(clippy::panic)]

use emulator_config::DataSourceKind;
use emulator_engine::{DispatchError, Dispatchers, PathSegment, ResolveError};
use indoc::indoc;
use insta::assert_json_snapshot;
use integration_tests::{caller, Emulator, Lambda};
use pretty_assertions::assert_eq;
use serde_json::json;

const CONFIG: &str = indoc! {r#"
    [[data_sources]]
    name = "Local"
    type = "NONE"

    [[data_sources]]
    name = "Prices"
    type = "AWS_LAMBDA"
    config = { function_name = "prices" }

    [[mapping_templates]]
    data_source = "Local"
    type = "Query"
    field = "getThing"
    request = "Query.getThing.request.vtl"
    response = "Query.getThing.response.vtl"

    [[mapping_templates]]
    data_source = "Prices"
    type = "Query"
    field = "getPrice"
    request = "Query.getPrice.request.vtl"
    response = "Query.getPrice.response.vtl"

    [[mapping_templates]]
    data_source = "Prices"
    type = "Mutation"
    field = "addPrice"
    request = "Mutation.addPrice.request.vtl"
    response = "Mutation.addPrice.response.vtl"
"#};

const GET_THING_REQUEST: &str = indoc! {r#"
    #set($x = $ctx.args.foo)
    #set($ctx.stash.thing = $x)
    {
      "version": "2017-02-28",
      "payload": { "id": "$x", "requestedBy": "$ctx.identity.username" }
    }
"#};

const GET_THING_RESPONSE: &str = r#"{ "id": "$ctx.stash.thing", "echo": $util.toJson($ctx.result) }"#;

const GET_PRICE_REQUEST: &str = indoc! {r#"
    #if($util.isNullOrEmpty($ctx.args.commodity))
      $util.error("commodity is required", "ValidationError", $ctx.args)
    #end
    $util.validate($ctx.args.commodity.length() < 10, "commodity is too long")
    {
      "version": "2017-02-28",
      "operation": "Invoke",
      "payload": $util.toJson($ctx.args)
    }
"#};

const GET_PRICE_RESPONSE: &str = "$util.toJson($ctx.result)";

const ADD_PRICE_REQUEST: &str = indoc! {r#"
    {
      "version": "2017-02-28",
      "operation": "Invoke",
      "payload": {
        "commodity": "$ctx.args.commodity",
        "amount": $ctx.args.amount,
        "key": $util.dynamodb.toMapValuesJson({ "commodity": $ctx.args.commodity })
      }
    }
"#};

const ADD_PRICE_RESPONSE: &str = indoc! {r#"
    #if($ctx.result.amount > 100)
      $util.unauthorized()
    #end
    $util.toJson($ctx.result)
"#};

fn templates() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Query.getThing.request.vtl", GET_THING_REQUEST),
        ("Query.getThing.response.vtl", GET_THING_RESPONSE),
        ("Query.getPrice.request.vtl", GET_PRICE_REQUEST),
        ("Query.getPrice.response.vtl", GET_PRICE_RESPONSE),
        ("Mutation.addPrice.request.vtl", ADD_PRICE_REQUEST),
        ("Mutation.addPrice.response.vtl", ADD_PRICE_RESPONSE),
    ]
}

async fn emulator(lambda: Lambda) -> Emulator {
    let dispatchers = Dispatchers::new().with_adapter(DataSourceKind::AwsLambda, lambda);
    Emulator::start(CONFIG, &templates(), dispatchers).await
}

#[tokio::test]
async fn passthrough_data_source() {
    let emulator = emulator(Lambda::echo()).await;

    let thing = emulator
        .resolve("Query", "getThing", json!({ "foo": "bar" }), &caller("jane"))
        .await
        .unwrap();

    assert_json_snapshot!(thing, @r###"
    {
      "id": "bar",
      "echo": {
        "id": "bar",
        "requestedBy": "jane"
      }
    }
    "###);
}

#[tokio::test]
async fn function_data_source_receives_the_rendered_request() {
    let lambda = Lambda::echo();
    let emulator = emulator(lambda.clone()).await;

    let added = emulator
        .resolve(
            "Mutation",
            "addPrice",
            json!({ "commodity": "foo", "amount": 12 }),
            &caller("jane"),
        )
        .await
        .unwrap();

    assert_eq!(added["amount"], json!(12));
    assert_json_snapshot!(lambda.invocations(), @r###"
    [
      {
        "dataSource": "Prices",
        "request": {
          "version": "2017-02-28",
          "operation": "Invoke",
          "payload": {
            "commodity": "foo",
            "amount": 12,
            "key": {
              "commodity": {
                "S": "foo"
              }
            }
          }
        }
      }
    ]
    "###);
}

#[tokio::test]
async fn reported_errors_reach_the_request_context() {
    let lambda = Lambda::echo();
    let emulator = emulator(lambda.clone()).await;
    let context = caller("jane");

    let error = emulator
        .resolve("Query", "getPrice", json!({ "commodity": "" }), &context)
        .await
        .unwrap_err();

    assert!(matches!(error, ResolveError::Field(_)), "{error}");
    assert!(lambda.invocations().is_empty());

    assert_json_snapshot!(context.errors(), @r###"
    [
      {
        "message": "commodity is required",
        "path": [
          "getPrice"
        ],
        "errorType": "ValidationError",
        "data": {
          "commodity": ""
        }
      }
    ]
    "###);
}

#[tokio::test]
async fn errors_of_sibling_fields_accumulate() {
    let emulator = emulator(Lambda::echo()).await;
    let context = caller("jane");

    let too_long = emulator
        .resolve("Query", "getPrice", json!({ "commodity": "a very long name" }), &context)
        .await;
    let too_expensive = emulator
        .resolve("Mutation", "addPrice", json!({ "commodity": "gold", "amount": 1000 }), &context)
        .await;
    let fine = emulator
        .resolve("Query", "getPrice", json!({ "commodity": "foo" }), &context)
        .await;

    assert!(too_long.is_err());
    assert!(too_expensive.is_err());
    assert_eq!(fine.unwrap(), json!({ "commodity": "foo" }));

    let errors: Vec<_> = context
        .errors()
        .into_iter()
        .map(|error| (error.message, error.error_type, error.path))
        .collect();

    assert_eq!(
        errors,
        vec![
            (
                "commodity is too long".to_string(),
                None,
                vec![PathSegment::from("getPrice")]
            ),
            (
                "Unauthorized".to_string(),
                Some("Unauthorized".to_string()),
                vec![PathSegment::from("addPrice")]
            ),
        ]
    );
}

#[tokio::test]
async fn dispatch_failures_are_not_translated() {
    let lambda = Lambda::new(|_| Err(DispatchError::new("function timed out").with_code("Lambda.Timeout")));
    let emulator = emulator(lambda).await;
    let context = caller("jane");

    let error = emulator
        .resolve("Query", "getPrice", json!({ "commodity": "foo" }), &context)
        .await
        .unwrap_err();

    let ResolveError::Dispatch(dispatch) = &error else {
        panic!("unexpected error: {error}");
    };
    assert_eq!(dispatch.code.as_deref(), Some("Lambda.Timeout"));
    assert!(context.errors().is_empty());

    let field_error = error.to_graphql_error(&["getPrice".into()]);
    assert_eq!(field_error.message, "function timed out");
    assert_eq!(field_error.error_type.as_deref(), Some("Lambda.Timeout"));
}
